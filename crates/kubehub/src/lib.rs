//! Steward kubehub: resource store API over kube, watcher wiring and
//! ownership helpers.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    runtime::{watcher, WatchStreamExt},
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use steward_core::{Delta, ObjectKey, ReconcileError, StoreError, StoreResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod events;
mod memory;

pub use events::{ControllerEvent, EventSink, KubeEventSink, MemoryEventSink};
pub use memory::{MemoryApi, Op};

/// Bounds shared by every namespaced kind the controller watches or writes.
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Kube client from the inferred config (kubeconfig or in-cluster).
pub async fn client() -> Result<Client> {
    Client::try_default().await.context("inferring kube client config")
}

/// Cache/work key of an object; objects without a name are malformed.
pub fn key_of<K: Resource>(obj: &K) -> Result<ObjectKey, ReconcileError> {
    let meta = obj.meta();
    ObjectKey::from_parts(meta.namespace.as_deref(), meta.name.as_deref())
}

/// The owner reference flagged `controller: true`, if any. Other owner
/// references are never trusted.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Key of the controlling owner when it is of `owner_kind`. Owners live in
/// the dependent's namespace.
pub fn owner_key(meta: &ObjectMeta, owner_kind: &str) -> Option<ObjectKey> {
    let owner = controller_of(meta)?;
    if owner.kind != owner_kind || owner.name.is_empty() {
        return None;
    }
    Some(ObjectKey { namespace: meta.namespace.clone(), name: owner.name.clone() })
}

/// Whether `meta` carries a controller reference pointing at `owner`.
/// UIDs decide; kind+name is the fallback for owners without a UID.
pub fn is_controlled_by<O: Resource<DynamicType = ()>>(meta: &ObjectMeta, owner: &O) -> bool {
    let Some(r) = controller_of(meta) else { return false };
    match owner.meta().uid.as_deref() {
        Some(uid) => r.uid == uid,
        None => r.kind == O::kind(&()) && Some(r.name.as_str()) == owner.meta().name.as_deref(),
    }
}

/// Operations the controller needs from the resource store, keyed by
/// namespace+name.
#[async_trait]
pub trait ResourceApi<K: Object>: Send + Sync {
    /// List then watch. The stream starts with an `Init .. InitDone` listing
    /// and repeats it whenever the watch has to re-list.
    fn watch(&self) -> BoxStream<'static, StoreResult<Delta<K>>>;

    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<K>>;

    async fn create(&self, obj: &K) -> StoreResult<K>;

    /// Persist the `status` of `obj` (status subresource).
    async fn update_status(&self, obj: &K) -> StoreResult<K>;

    /// Deleting an object that is already gone yields `NotFound`.
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;
}

/// `ResourceApi` backed by the cluster API server.
pub struct KubeApi<K> {
    client: Client,
    /// Watch scope; `None` watches all namespaces.
    namespace: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Object> KubeApi<K> {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace, _kind: PhantomData }
    }

    pub fn shared(client: Client, namespace: Option<String>) -> Arc<dyn ResourceApi<K>> {
        Arc::new(Self::new(client, namespace))
    }

    fn api(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

fn store_error(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message.clone()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(ae.message.clone())
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message.clone()),
        other => StoreError::Transient(other.to_string()),
    }
}

fn delta_from<K>(ev: watcher::Event<K>) -> Delta<K> {
    match ev {
        watcher::Event::Apply(o) => Delta::Applied(o),
        watcher::Event::Delete(o) => Delta::Deleted(o),
        watcher::Event::Init => Delta::Init,
        watcher::Event::InitApply(o) => Delta::InitApplied(o),
        watcher::Event::InitDone => Delta::InitDone,
    }
}

fn name_of<K: Resource>(obj: &K) -> StoreResult<String> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| StoreError::Transient("object has no metadata.name".into()))
}

#[async_trait]
impl<K: Object> ResourceApi<K> for KubeApi<K> {
    fn watch(&self) -> BoxStream<'static, StoreResult<Delta<K>>> {
        let api = self.api(self.namespace.as_deref());
        watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .map(|ev| ev.map(delta_from).map_err(|e| StoreError::Transient(e.to_string())))
            .boxed()
    }

    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<K>> {
        self.api(key.namespace()).get_opt(&key.name).await.map_err(store_error)
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        self.api(obj.meta().namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(store_error)
    }

    async fn update_status(&self, obj: &K) -> StoreResult<K> {
        let name = name_of(obj)?;
        let raw = serde_json::to_value(obj).map_err(|e| StoreError::Transient(e.to_string()))?;
        let status = raw.get("status").cloned().unwrap_or(serde_json::Value::Null);
        let patch = serde_json::json!({ "status": status });
        self.api(obj.meta().namespace.as_deref())
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(store_error)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        self.api(key.namespace())
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(store_error)
    }
}

/// Pump a watch stream into `delta_tx` until shutdown, the stream ends or the
/// receiving cache goes away. Stream errors are logged; the stream itself
/// owns reconnect backoff.
pub async fn start_watcher<K: Object>(
    api: Arc<dyn ResourceApi<K>>,
    delta_tx: mpsc::Sender<Delta<K>>,
    shutdown: CancellationToken,
) {
    let kind = K::kind(&()).to_string();
    let mut stream = api.watch();
    info!(kind = %kind, "watcher started");
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(kind = %kind, "watcher cancelled");
                break;
            }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(d)) => {
                if delta_tx.send(d).await.is_err() {
                    debug!(kind = %kind, "delta receiver closed");
                    break;
                }
            }
            Some(Err(e)) => {
                metrics::counter!("watch_errors_total", 1u64, "kind" => kind.clone());
                warn!(kind = %kind, error = %e, "watch error");
            }
            None => {
                warn!(kind = %kind, "watcher stream ended");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::Ingress;

    fn owned(kind: &str, name: &str, uid: &str, controller: Option<bool>) -> ObjectMeta {
        ObjectMeta {
            name: Some("dep".into()),
            namespace: Some("ns".into()),
            owner_references: Some(vec![OwnerReference {
                api_version: "v1".into(),
                kind: kind.into(),
                name: name.into(),
                uid: uid.into(),
                controller,
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn owner_key_requires_controller_flag_and_kind() {
        assert_eq!(
            owner_key(&owned("Service", "svc-a", "u1", Some(true)), "Service"),
            Some(ObjectKey::new("ns", "svc-a"))
        );
        assert_eq!(owner_key(&owned("Service", "svc-a", "u1", Some(false)), "Service"), None);
        assert_eq!(owner_key(&owned("Service", "svc-a", "u1", None), "Service"), None);
        assert_eq!(owner_key(&owned("App", "svc-a", "u1", Some(true)), "Service"), None);
        assert_eq!(owner_key(&ObjectMeta::default(), "Service"), None);
    }

    #[test]
    fn controlled_by_compares_uids() {
        let mut owner = Ingress::default();
        owner.metadata.name = Some("svc-a".into());
        owner.metadata.uid = Some("u1".into());
        assert!(is_controlled_by(&owned("Ingress", "svc-a", "u1", Some(true)), &owner));
        assert!(!is_controlled_by(&owned("Ingress", "svc-a", "u2", Some(true)), &owner));
        assert!(!is_controlled_by(&owned("Ingress", "svc-a", "u1", Some(false)), &owner));
    }

    #[test]
    fn missing_name_is_malformed() {
        let ing = Ingress::default();
        assert!(matches!(key_of(&ing), Err(ReconcileError::MalformedKey(_))));
    }
}
