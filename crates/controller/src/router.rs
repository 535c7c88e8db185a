//! Event router: turns cache notifications into work keys.

use std::marker::PhantomData;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use steward_core::{Notification, ObjectKey};
use steward_kubehub::{key_of, owner_key};
use steward_queue::WorkQueue;
use tracing::{trace, warn};

use crate::reconcile::Primary;

/// What happened to a dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added,
    Updated,
    Deleted,
}

impl Change {
    pub fn of<K>(n: &Notification<K>) -> Self {
        match n {
            Notification::Added(_) => Change::Added,
            Notification::Updated { .. } => Change::Updated,
            Notification::Deleted(_) => Change::Deleted,
        }
    }
}

/// A notification tagged with the role of the cache it came from.
pub enum Signal<'a, P> {
    Primary(&'a Notification<P>),
    Dependent { kind: &'a str, change: Change, meta: &'a ObjectMeta },
}

pub struct Router<P> {
    queue: WorkQueue<ObjectKey>,
    primary_kind: String,
    _primary: PhantomData<fn() -> P>,
}

impl<P: Primary> Router<P> {
    pub fn new(queue: WorkQueue<ObjectKey>) -> Self {
        Self { queue, primary_kind: P::kind(&()).to_string(), _primary: PhantomData }
    }

    /// Enqueue the primary a signal concerns, if any. Returns the key added.
    pub fn route(&self, signal: Signal<'_, P>) -> Option<ObjectKey> {
        let key = match signal {
            Signal::Primary(Notification::Added(obj)) => key_of(obj.as_ref()),
            Signal::Primary(Notification::Updated { old, new }) => {
                if !P::affects_dependents(old, new) {
                    trace!(kind = %self.primary_kind, name = ?new.meta().name, "update ignored");
                    return None;
                }
                key_of(new.as_ref())
            }
            // cascade deletion belongs to the store's garbage collector
            Signal::Primary(Notification::Deleted(_)) => return None,
            Signal::Dependent { kind, change: Change::Deleted, meta } => match owner_key(meta, &self.primary_kind) {
                Some(owner) => {
                    trace!(dependent = %kind, owner = %owner, "owned dependent deleted");
                    Ok(owner)
                }
                None => return None,
            },
            Signal::Dependent { .. } => return None,
        };
        match key {
            Ok(key) => {
                metrics::counter!("router_enqueued_total", 1u64, "kind" => self.primary_kind.clone());
                self.queue.add(key.clone());
                Some(key)
            }
            Err(e) => {
                warn!(kind = %self.primary_kind, error = %e, "dropping notification");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::api::networking::v1::Ingress;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use super::*;

    fn queue() -> WorkQueue<ObjectKey> { WorkQueue::with_default_limiter("router-test") }

    fn svc(name: &str, annotated: bool) -> Arc<Service> {
        let mut s = Service::default();
        s.metadata.name = Some(name.into());
        s.metadata.namespace = Some("default".into());
        s.metadata.uid = Some(format!("uid-{name}"));
        if annotated {
            s.metadata.annotations = Some(BTreeMap::from([("ingress/http".to_string(), "true".to_string())]));
        }
        Arc::new(s)
    }

    fn owned_ingress(owner_kind: &str, controller: bool) -> Ingress {
        let mut i = Ingress::default();
        i.metadata.name = Some("svc-a".into());
        i.metadata.namespace = Some("default".into());
        i.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".into(),
            kind: owner_kind.into(),
            name: "svc-a".into(),
            uid: "uid-svc-a".into(),
            controller: Some(controller),
            ..Default::default()
        }]);
        i
    }

    #[tokio::test]
    async fn primary_adds_always_enqueue() {
        let q = queue();
        let r = Router::<Service>::new(q.clone());
        assert_eq!(r.route(Signal::Primary(&Notification::Added(svc("svc-a", false)))), Some(ObjectKey::new("default", "svc-a")));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn irrelevant_primary_updates_are_suppressed() {
        let q = queue();
        let r = Router::<Service>::new(q.clone());
        let old = svc("svc-a", false);
        let mut status_only = (*old).clone();
        status_only.metadata.resource_version = Some("9".into());
        let n = Notification::Updated { old: Arc::clone(&old), new: Arc::new(status_only) };
        assert_eq!(r.route(Signal::Primary(&n)), None);

        let n = Notification::Updated { old, new: svc("svc-a", true) };
        assert!(r.route(Signal::Primary(&n)).is_some());
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn primary_deletes_are_ignored() {
        let q = queue();
        let r = Router::<Service>::new(q.clone());
        assert_eq!(r.route(Signal::Primary(&Notification::Deleted(svc("svc-a", true)))), None);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn dependent_delete_enqueues_controlling_owner() {
        let q = queue();
        let r = Router::<Service>::new(q.clone());
        let ing = owned_ingress("Service", true);
        let sig = Signal::Dependent { kind: "Ingress", change: Change::Deleted, meta: &ing.metadata };
        assert_eq!(r.route(sig), Some(ObjectKey::new("default", "svc-a")));

        for change in [Change::Added, Change::Updated] {
            assert_eq!(r.route(Signal::Dependent { kind: "Ingress", change, meta: &ing.metadata }), None);
        }
    }

    #[tokio::test]
    async fn dependent_delete_without_matching_controller_is_ignored() {
        let q = queue();
        let r = Router::<Service>::new(q.clone());
        for ing in [owned_ingress("Deployment", true), owned_ingress("Service", false), Ingress::default()] {
            let sig = Signal::Dependent { kind: "Ingress", change: Change::Deleted, meta: &ing.metadata };
            assert_eq!(r.route(sig), None);
        }
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn nameless_primary_is_dropped() {
        let q = queue();
        let r = Router::<Service>::new(q.clone());
        assert_eq!(r.route(Signal::Primary(&Notification::Added(Arc::new(Service::default())))), None);
        assert!(q.is_empty());
    }
}
