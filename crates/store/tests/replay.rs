#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use steward_core::{Delta, Notification, ObjectKey};
use steward_store::{spawn_ingest, wait_for_cache_sync, Handler, Index};
use tokio_util::sync::CancellationToken;

fn cm(name: &str, owner_uid: Option<&str>) -> ConfigMap {
    let mut c = ConfigMap::default();
    c.metadata.name = Some(name.into());
    c.metadata.namespace = Some("ns".into());
    if let Some(uid) = owner_uid {
        c.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".into(),
            kind: "Service".into(),
            name: "svc".into(),
            uid: uid.into(),
            controller: Some(true),
            ..Default::default()
        }]);
    }
    c
}

fn label(n: &Notification<ConfigMap>) -> String {
    let name = n.object().metadata.name.clone().unwrap_or_default();
    match n {
        Notification::Added(_) => format!("added {name}"),
        Notification::Updated { .. } => format!("updated {name}"),
        Notification::Deleted(_) => format!("deleted {name}"),
    }
}

#[test]
fn replay_basic_sequence() {
    let mut idx = Index::<ConfigMap>::new();

    // Apply in two batches like ingest would
    let notes = idx.apply(vec![Delta::Applied(cm("a", None)), Delta::Applied(cm("a", None))]);
    let snap1 = idx.freeze();
    assert_eq!(snap1.epoch, 1);
    assert_eq!(snap1.len(), 1);
    assert_eq!(notes.iter().map(label).collect::<Vec<_>>(), ["added a", "updated a"]);

    let notes = idx.apply(vec![Delta::Applied(cm("b", None)), Delta::Deleted(cm("a", None))]);
    let snap2 = idx.freeze();
    assert_eq!(snap2.epoch, 2);
    assert_eq!(snap2.len(), 1);
    assert!(snap2.get(&ObjectKey::new("ns", "b")).is_some());
    assert!(snap2.get(&ObjectKey::new("ns", "a")).is_none());
    assert_eq!(notes.iter().map(label).collect::<Vec<_>>(), ["added b", "deleted a"]);

    // earlier snapshots are immutable
    assert!(snap1.get(&ObjectKey::new("ns", "a")).is_some());
}

#[test]
fn update_carries_previous_state() {
    let mut idx = Index::<ConfigMap>::new();
    idx.apply(vec![Delta::Applied(cm("a", None))]);
    let mut changed = cm("a", None);
    changed.data = Some([("k".to_string(), "v".to_string())].into_iter().collect());
    let notes = idx.apply(vec![Delta::Applied(changed)]);
    match &notes[..] {
        [Notification::Updated { old, new }] => {
            assert!(old.data.is_none());
            assert_eq!(new.data.as_ref().map(|d| d.len()), Some(1));
        }
        other => panic!("unexpected notifications: {other:?}"),
    }
}

#[test]
fn relist_drops_objects_missing_from_listing() {
    let mut idx = Index::<ConfigMap>::new();
    idx.apply(vec![Delta::Init, Delta::InitApplied(cm("a", None)), Delta::InitApplied(cm("b", None)), Delta::InitDone]);
    assert!(idx.is_synced());
    assert_eq!(idx.len(), 2);

    // watch reconnects; b was deleted while we were away
    let notes = idx.apply(vec![Delta::Init, Delta::InitApplied(cm("a", None)), Delta::InitDone]);
    assert_eq!(notes.iter().map(label).collect::<Vec<_>>(), ["updated a", "deleted b"]);
    assert_eq!(idx.len(), 1);
}

#[test]
fn owner_index_follows_controller_refs() {
    let mut idx = Index::<ConfigMap>::new();
    idx.apply(vec![
        Delta::Applied(cm("a", Some("u1"))),
        Delta::Applied(cm("b", Some("u1"))),
        Delta::Applied(cm("c", Some("u2"))),
        Delta::Applied(cm("d", None)),
    ]);
    let snap = idx.freeze();
    let mut owned: Vec<String> =
        snap.owned_by("u1").iter().filter_map(|o| o.metadata.name.clone()).collect();
    owned.sort();
    assert_eq!(owned, ["a", "b"]);

    // re-parenting and deletion keep the index exact
    idx.apply(vec![Delta::Applied(cm("a", Some("u2"))), Delta::Deleted(cm("b", Some("u1")))]);
    let snap = idx.freeze();
    assert!(snap.owned_by("u1").is_empty());
    assert_eq!(snap.owned_by("u2").len(), 2);
}

#[test]
fn nameless_objects_are_skipped() {
    let mut idx = Index::<ConfigMap>::new();
    let notes = idx.apply(vec![Delta::Applied(ConfigMap::default())]);
    assert!(notes.is_empty());
    assert!(idx.is_empty());
}

#[tokio::test]
async fn ingest_publishes_snapshot_before_notifying() {
    let seen: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let cache_slot: Arc<Mutex<Option<steward_store::Cache<ConfigMap>>>> = Arc::new(Mutex::new(None));

    let handler: Arc<dyn Handler<ConfigMap>> = {
        let seen = Arc::clone(&seen);
        let slot = Arc::clone(&cache_slot);
        Arc::new(move |n: Notification<ConfigMap>| {
            let key = ObjectKey::new("ns", n.object().metadata.name.clone().unwrap_or_default());
            let visible = slot.lock().unwrap().as_ref().map(|c| c.get(&key).is_some()).unwrap_or(false);
            seen.lock().unwrap().push((label(&n), visible));
        })
    };
    let (tx, cache) = spawn_ingest::<ConfigMap>(16, Some(handler));
    *cache_slot.lock().unwrap() = Some(cache.clone());
    assert!(!cache.has_synced());

    tx.send(Delta::Init).await.unwrap();
    tx.send(Delta::InitApplied(cm("a", None))).await.unwrap();
    tx.send(Delta::InitDone).await.unwrap();

    let shutdown = CancellationToken::new();
    assert!(wait_for_cache_sync(&[cache.synced()], &shutdown).await);
    assert_eq!(cache.list().len(), 1);
    assert!(*cache.subscribe_epoch().borrow() >= 1);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![("added a".to_string(), true)]);
}

#[tokio::test]
async fn sync_wait_gives_up_on_shutdown() {
    let (_tx, cache) = spawn_ingest::<ConfigMap>(4, None);
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    assert!(!wait_for_cache_sync(&[cache.synced()], &shutdown).await);
}
