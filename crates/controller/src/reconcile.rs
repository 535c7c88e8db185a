//! Reconcile engine.
//!
//! One pass drives every dependent kind of a primary toward the desired state
//! and then writes the recomputed status. Dependents are only ever created or
//! deleted; an object occupying a dependent's name that this primary does not
//! control is never touched.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Resource;
use steward_core::{ObjectKey, ReconcileError};
use steward_kubehub::{is_controlled_by, key_of, ControllerEvent, EventSink, Object, ResourceApi};
use steward_store::Cache;
use tracing::{debug, info, warn};

/// A resource that owns dependents.
pub trait Primary: Object + PartialEq {
    /// Part of the status the controller computes.
    type Status: Clone + Default + PartialEq + Debug + Send + Sync;

    fn status(&self) -> Self::Status;
    fn set_status(&mut self, status: Self::Status);

    /// Whether an update can change the desired dependents.
    fn affects_dependents(old: &Self, new: &Self) -> bool { old != new }
}

/// Renders one dependent kind of a primary. One template per dependent kind.
pub trait Template<P: Primary>: Send + Sync + 'static {
    type Object: Object;

    /// Desired dependent, or `None` when it should not exist. Namespace and
    /// controller reference are filled in by the engine.
    fn render(&self, primary: &P) -> Option<Self::Object>;

    /// Copy observed fields of an owned dependent into the status.
    fn observe(&self, _dependent: &Self::Object, _status: &mut P::Status) {}

    /// Drop mirrored fields once the dependent is not wanted.
    fn clear(&self, _status: &mut P::Status) {}
}

/// Type-erased dependent handler driven by the engine.
#[async_trait]
pub trait Dependent<P: Primary>: Send + Sync {
    fn kind(&self) -> String;

    /// Converge this dependent kind for `primary`. Returns whether anything
    /// was created or deleted.
    async fn sync(&self, primary: &P, status: &mut P::Status) -> Result<bool, ReconcileError>;
}

/// [`Dependent`] backed by a template, the dependent's cache and its store API.
pub struct Managed<P: Primary, T: Template<P>> {
    template: T,
    cache: Cache<T::Object>,
    api: Arc<dyn ResourceApi<T::Object>>,
    _primary: PhantomData<fn() -> P>,
}

impl<P: Primary, T: Template<P>> Managed<P, T> {
    pub fn new(template: T, cache: Cache<T::Object>, api: Arc<dyn ResourceApi<T::Object>>) -> Self {
        Self { template, cache, api, _primary: PhantomData }
    }

    fn desired(&self, primary: &P) -> Result<Option<T::Object>, ReconcileError> {
        let Some(mut obj) = self.template.render(primary) else { return Ok(None) };
        let owner = primary.controller_owner_ref(&()).ok_or_else(|| {
            ReconcileError::MalformedKey(format!("{} without name or uid cannot own dependents", P::kind(&())))
        })?;
        let meta = obj.meta_mut();
        meta.namespace = primary.meta().namespace.clone();
        meta.owner_references = Some(vec![owner]);
        Ok(Some(obj))
    }

    /// Delete owned dependents other than the one named `keep`.
    async fn prune(&self, primary: &P, keep: Option<&str>) -> Result<bool, ReconcileError> {
        let Some(uid) = primary.meta().uid.as_deref() else { return Ok(false) };
        let mut deleted = false;
        for stale in self.cache.owned_by(uid) {
            let meta = stale.meta();
            if meta.name.as_deref() == keep || meta.namespace != primary.meta().namespace {
                continue;
            }
            let key = key_of(stale.as_ref())?;
            match self.api.delete(&key).await {
                Ok(()) => {
                    info!(kind = %self.kind(), key = %key, "deleted owned dependent");
                    deleted = true;
                }
                Err(e) if e.is_not_found() => debug!(key = %key, "dependent already gone"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }

    async fn create(&self, desired: &T::Object, key: &ObjectKey) -> Result<(T::Object, bool), ReconcileError> {
        match self.api.create(desired).await {
            Ok(created) => {
                info!(kind = %self.kind(), key = %key, "created dependent");
                // cache lags the write; read back from the store
                let fresh = match self.api.get(key).await {
                    Ok(Some(obj)) => obj,
                    Ok(None) => created,
                    Err(e) => {
                        debug!(key = %key, error = %e, "re-fetch after create failed; using create response");
                        created
                    }
                };
                Ok((fresh, true))
            }
            Err(e) if e.is_already_exists() => match self.api.get(key).await? {
                Some(existing) => Ok((existing, false)),
                None => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<P: Primary, T: Template<P>> Dependent<P> for Managed<P, T> {
    fn kind(&self) -> String { <T::Object as Resource>::kind(&()).to_string() }

    async fn sync(&self, primary: &P, status: &mut P::Status) -> Result<bool, ReconcileError> {
        let desired = self.desired(primary)?;
        let keep = desired.as_ref().and_then(|d| d.meta().name.clone());
        let mut mutated = self.prune(primary, keep.as_deref()).await?;

        let Some(desired) = desired else {
            self.template.clear(status);
            return Ok(mutated);
        };
        let key = key_of(&desired)?;
        let actual = match self.cache.get(&key) {
            Some(cached) => cached.as_ref().clone(),
            None => {
                let (obj, created) = self.create(&desired, &key).await?;
                mutated |= created;
                obj
            }
        };
        if !is_controlled_by(actual.meta(), primary) {
            return Err(ReconcileError::OwnershipConflict {
                kind: self.kind(),
                key,
                owner_kind: P::kind(&()).to_string(),
                owner: primary.meta().name.clone().unwrap_or_default(),
            });
        }
        self.template.observe(&actual, status);
        Ok(mutated)
    }
}

/// Runs reconcile passes for one primary kind.
pub struct Reconciler<P: Primary> {
    name: String,
    cache: Cache<P>,
    api: Arc<dyn ResourceApi<P>>,
    dependents: Vec<Box<dyn Dependent<P>>>,
    events: Arc<dyn EventSink>,
}

impl<P: Primary> Reconciler<P> {
    pub fn new(
        name: impl Into<String>,
        cache: Cache<P>,
        api: Arc<dyn ResourceApi<P>>,
        dependents: Vec<Box<dyn Dependent<P>>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self { name: name.into(), cache, api, dependents, events }
    }

    pub fn name(&self) -> &str { &self.name }

    /// Reference to the cached primary, for events.
    pub fn object_ref(&self, key: &ObjectKey) -> Option<ObjectReference> {
        self.cache.get(key).map(|p| p.object_ref(&()))
    }

    /// One full pass for `key`. Either every step succeeds or the pass fails
    /// at the first error without writing status.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        let started = Instant::now();
        let result = self.pass(key).await;
        metrics::histogram!(
            "reconcile_duration_seconds",
            started.elapsed().as_secs_f64(),
            "controller" => self.name.clone(),
            "result" => if result.is_ok() { "ok" } else { "error" }
        );
        result
    }

    async fn pass(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        let Some(primary) = self.cache.get(key) else {
            debug!(controller = %self.name, key = %key, "primary no longer exists");
            return Ok(());
        };
        if primary.meta().deletion_timestamp.is_some() {
            debug!(controller = %self.name, key = %key, "primary is being deleted");
            return Ok(());
        }
        let before = primary.status();
        let mut status = before.clone();
        let mut mutated = false;

        for dependent in &self.dependents {
            match dependent.sync(&primary, &mut status).await {
                Ok(changed) => mutated |= changed,
                Err(e) => {
                    if let ReconcileError::OwnershipConflict { key: taken, .. } = &e {
                        let message = format!(
                            "Resource {:?} already exists and is not managed by {}",
                            taken.name,
                            P::kind(&())
                        );
                        warn!(controller = %self.name, key = %key, dependent = %taken, "ownership conflict");
                        self.events
                            .publish(ControllerEvent::warning(primary.object_ref(&()), "ErrResourceExists", message))
                            .await;
                    }
                    return Err(e);
                }
            }
        }

        if status != before {
            let mut updated = primary.as_ref().clone();
            updated.set_status(status);
            match self.api.update_status(&updated).await {
                Ok(_) => mutated = true,
                Err(e) if e.is_not_found() => {
                    debug!(controller = %self.name, key = %key, "primary deleted during pass");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        if mutated {
            let message = format!("{} synced successfully", P::kind(&()));
            self.events.publish(ControllerEvent::normal(primary.object_ref(&()), "Synced", message)).await;
        }
        Ok(())
    }

    pub(crate) async fn report_abandoned(&self, key: &ObjectKey, message: String) {
        if let Some(object) = self.object_ref(key) {
            self.events.publish(ControllerEvent::warning(object, "ReconcileFailed", message)).await;
        }
    }
}
