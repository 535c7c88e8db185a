//! Steward store: the watch cache.
//!
//! One ingest task per watched kind consumes watch deltas, maintains a
//! namespace+name index (plus a controller-owner index) and publishes
//! immutable snapshots. Readers load the latest snapshot without locking and
//! never wait on the network. Handlers see a notification only after the
//! snapshot containing that change has been published.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use kube::Resource;
use rustc_hash::{FxHashMap, FxHashSet};
use steward_core::{Delta, Notification, ObjectKey};
use steward_kubehub::{controller_of, key_of, Object};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on deltas folded into one snapshot swap.
const MAX_BATCH: usize = 256;

/// Receives cache notifications. Called from the ingest task; must not block.
pub trait Handler<K>: Send + Sync {
    fn handle(&self, notification: Notification<K>);
}

impl<K, F> Handler<K> for F
where
    F: Fn(Notification<K>) + Send + Sync,
{
    fn handle(&self, notification: Notification<K>) { self(notification) }
}

/// Point-in-time view of one kind.
pub struct Snapshot<K> {
    pub epoch: u64,
    items: FxHashMap<ObjectKey, Arc<K>>,
    by_owner: FxHashMap<String, Vec<ObjectKey>>,
}

impl<K> Default for Snapshot<K> {
    fn default() -> Self {
        Self { epoch: 0, items: FxHashMap::default(), by_owner: FxHashMap::default() }
    }
}

impl<K> Snapshot<K> {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> { self.items.get(key).cloned() }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Objects whose controller reference carries `uid`.
    pub fn owned_by(&self, uid: &str) -> Vec<Arc<K>> {
        self.by_owner
            .get(uid)
            .map(|keys| keys.iter().filter_map(|k| self.items.get(k).cloned()).collect())
            .unwrap_or_default()
    }
}

/// Mutable index driven by the ingest task. Public so replay tests can feed
/// it synchronously.
pub struct Index<K> {
    epoch: u64,
    items: FxHashMap<ObjectKey, Arc<K>>,
    by_owner: FxHashMap<String, FxHashSet<ObjectKey>>,
    /// Keys seen since the last `Init`, while a listing is in progress.
    relist: Option<FxHashSet<ObjectKey>>,
    synced: bool,
}

impl<K: Object> Default for Index<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Object> Index<K> {
    pub fn new() -> Self {
        Self {
            epoch: 0,
            items: FxHashMap::default(),
            by_owner: FxHashMap::default(),
            relist: None,
            synced: false,
        }
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn is_synced(&self) -> bool { self.synced }

    /// Apply a batch of deltas, returning the notifications they produce in
    /// order. Bumps the epoch once per batch.
    pub fn apply<I: IntoIterator<Item = Delta<K>>>(&mut self, batch: I) -> Vec<Notification<K>> {
        let mut out = Vec::new();
        for delta in batch {
            match delta {
                Delta::Applied(obj) => self.upsert(obj, &mut out),
                Delta::InitApplied(obj) => {
                    if let (Some(seen), Ok(key)) = (self.relist.as_mut(), key_of(&obj)) {
                        seen.insert(key);
                    }
                    self.upsert(obj, &mut out);
                }
                Delta::Deleted(obj) => match key_of(&obj) {
                    Ok(key) => {
                        self.remove(&key);
                        out.push(Notification::Deleted(Arc::new(obj)));
                    }
                    Err(e) => warn!(error = %e, "dropping delete without a usable key"),
                },
                Delta::Init => self.relist = Some(FxHashSet::default()),
                Delta::InitDone => {
                    if let Some(seen) = self.relist.take() {
                        let stale: Vec<ObjectKey> =
                            self.items.keys().filter(|k| !seen.contains(*k)).cloned().collect();
                        for key in stale {
                            if let Some(gone) = self.remove(&key) {
                                debug!(key = %key, "object vanished during relist");
                                out.push(Notification::Deleted(gone));
                            }
                        }
                    }
                    self.synced = true;
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        out
    }

    fn upsert(&mut self, obj: K, out: &mut Vec<Notification<K>>) {
        let key = match key_of(&obj) {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, "dropping object without a usable key");
                return;
            }
        };
        let new = Arc::new(obj);
        self.index_owner(&key, &new);
        match self.items.insert(key.clone(), Arc::clone(&new)) {
            Some(old) => {
                if owner_uid(old.as_ref()) != owner_uid(new.as_ref()) {
                    self.unindex_owner(&key, &old);
                    self.index_owner(&key, &new);
                }
                out.push(Notification::Updated { old, new });
            }
            None => out.push(Notification::Added(new)),
        }
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<Arc<K>> {
        let gone = self.items.remove(key)?;
        self.unindex_owner(key, &gone);
        Some(gone)
    }

    fn index_owner(&mut self, key: &ObjectKey, obj: &K) {
        if let Some(uid) = owner_uid(obj) {
            self.by_owner.entry(uid).or_default().insert(key.clone());
        }
    }

    fn unindex_owner(&mut self, key: &ObjectKey, obj: &K) {
        let Some(uid) = owner_uid(obj) else { return };
        if let Some(keys) = self.by_owner.get_mut(&uid) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_owner.remove(&uid);
            }
        }
    }

    pub fn freeze(&self) -> Arc<Snapshot<K>> {
        let by_owner = self
            .by_owner
            .iter()
            .map(|(uid, keys)| (uid.clone(), keys.iter().cloned().collect()))
            .collect();
        Arc::new(Snapshot { epoch: self.epoch, items: self.items.clone(), by_owner })
    }
}

fn owner_uid<K: Resource>(obj: &K) -> Option<String> {
    controller_of(obj.meta()).map(|r| r.uid.clone())
}

/// Read handle over one kind's cache.
pub struct Cache<K> {
    snap: Arc<ArcSwap<Snapshot<K>>>,
    epoch_rx: watch::Receiver<u64>,
    synced_rx: watch::Receiver<bool>,
}

impl<K> Clone for Cache<K> {
    fn clone(&self) -> Self {
        Self {
            snap: Arc::clone(&self.snap),
            epoch_rx: self.epoch_rx.clone(),
            synced_rx: self.synced_rx.clone(),
        }
    }
}

impl<K> Cache<K> {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> { self.snap.load().get(key) }
    pub fn list(&self) -> Vec<Arc<K>> { self.snap.load().items.values().cloned().collect() }
    pub fn keys(&self) -> Vec<ObjectKey> { self.snap.load().items.keys().cloned().collect() }
    pub fn owned_by(&self, uid: &str) -> Vec<Arc<K>> { self.snap.load().owned_by(uid) }
    pub fn has_synced(&self) -> bool { *self.synced_rx.borrow() }
    pub fn synced(&self) -> watch::Receiver<bool> { self.synced_rx.clone() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

/// Spawn an ingest loop for kind `K`. Returns the delta sender the watcher
/// writes into and a read handle. The loop exits once every sender is dropped.
pub fn spawn_ingest<K: Object>(
    cap: usize,
    handler: Option<Arc<dyn Handler<K>>>,
) -> (mpsc::Sender<Delta<K>>, Cache<K>) {
    let (tx, mut rx) = mpsc::channel::<Delta<K>>(cap.max(1));
    let snap = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let (synced_tx, synced_rx) = watch::channel(false);
    let snap_clone = Arc::clone(&snap);
    let kind = K::kind(&()).to_string();

    tokio::spawn(async move {
        let mut index = Index::<K>::new();
        let mut batch = Vec::with_capacity(MAX_BATCH);
        while let Some(first) = rx.recv().await {
            batch.push(first);
            while batch.len() < MAX_BATCH {
                match rx.try_recv() {
                    Ok(d) => batch.push(d),
                    Err(_) => break,
                }
            }
            let deltas = batch.len();
            let notes = index.apply(batch.drain(..));
            let next = index.freeze();
            let epoch = next.epoch;
            metrics::gauge!("cache_objects", next.len() as f64, "kind" => kind.clone());
            metrics::counter!("cache_deltas_total", deltas as u64, "kind" => kind.clone());
            snap_clone.store(next);
            epoch_tx.send_replace(epoch);
            if let Some(h) = &handler {
                for n in notes {
                    h.handle(n);
                }
            }
            if index.is_synced() && !*synced_tx.borrow() {
                info!(kind = %kind, objects = index.len(), "cache synced");
                synced_tx.send_replace(true);
            }
        }
        debug!(kind = %kind, "delta channel closed; ingest loop stopped");
    });

    (tx, Cache { snap, epoch_rx, synced_rx })
}

/// Wait until every cache reports its initial listing. Returns `false` when
/// shutdown fires first or a cache closes before syncing.
pub async fn wait_for_cache_sync(signals: &[watch::Receiver<bool>], shutdown: &CancellationToken) -> bool {
    for signal in signals {
        let mut rx = signal.clone();
        loop {
            let synced = *rx.borrow_and_update();
            if synced {
                break;
            }
            tokio::select! {
                changed = rx.changed() => if changed.is_err() {
                    warn!("cache closed before it synced");
                    return false;
                },
                _ = shutdown.cancelled() => return false,
            }
        }
    }
    true
}
