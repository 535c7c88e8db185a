//! Steward core types: object keys, watch deltas, cache notifications.
//!
//! Kept free of any Kubernetes client types so the queue and the error
//! taxonomy can be used (and tested) without a cluster.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

mod error;

pub use error::{EventKind, ReconcileError, StoreError, StoreResult};

/// Identity of one namespaced (or cluster-scoped) object.
///
/// Used both as the cache index key and as the unit of work handed to
/// reconcile workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

/// A primary resource waiting for (or undergoing) reconciliation.
pub type WorkKey = ObjectKey;

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    /// Build a key from raw metadata parts; an empty or missing name is malformed.
    pub fn from_parts(namespace: Option<&str>, name: Option<&str>) -> Result<Self, ReconcileError> {
        match name {
            Some(n) if !n.is_empty() => Ok(Self {
                namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
                name: n.to_string(),
            }),
            _ => Err(ReconcileError::MalformedKey(format!(
                "object in namespace {:?} has no name",
                namespace.unwrap_or("")
            ))),
        }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = ReconcileError;

    /// Accepts `namespace/name` or `name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(*name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::new(*ns, *name)),
            _ => Err(ReconcileError::MalformedKey(format!("unexpected key format: {:?}", s))),
        }
    }
}

/// One change observed on a watch stream.
///
/// `Init` .. `InitApplied`* .. `InitDone` brackets a full (re)list; objects
/// cached before `Init` and not re-listed before `InitDone` are gone.
#[derive(Debug, Clone)]
pub enum Delta<K> {
    Applied(K),
    Deleted(K),
    Init,
    InitApplied(K),
    InitDone,
}

/// Change notification handed from a cache to its handler, carrying the
/// previous state for updates.
#[derive(Debug, Clone)]
pub enum Notification<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> Notification<K> {
    /// The most recent state carried by the notification.
    pub fn object(&self) -> &Arc<K> {
        match self {
            Notification::Added(o) | Notification::Deleted(o) => o,
            Notification::Updated { new, .. } => new,
        }
    }
}
