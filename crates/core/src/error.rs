
use crate::ObjectKey;

/// Errors surfaced by the external resource store.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Optimistic-concurrency conflict on write.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Network, timeout, throttling or any other failure worth retrying.
    #[error("transient store error: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists(_)) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a failed reconcile pass.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The dependent identity is occupied by an object this primary does not control.
    #[error("{kind} {key} already exists and is not managed by {owner_kind} {owner}")]
    OwnershipConflict { kind: String, key: ObjectKey, owner_kind: String, owner: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed key: {0}")]
    MalformedKey(String),
    #[error("giving up after {attempts} attempts: {source}")]
    PermanentFailure { attempts: u32, source: Box<ReconcileError> },
}

impl ReconcileError {
    /// Malformed keys and exhausted budgets are never worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReconcileError::MalformedKey(_) | ReconcileError::PermanentFailure { .. })
    }

    /// Short machine-readable label used in metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileError::OwnershipConflict { .. } => "ownership_conflict",
            ReconcileError::Store(StoreError::NotFound(_)) => "not_found",
            ReconcileError::Store(StoreError::AlreadyExists(_)) => "already_exists",
            ReconcileError::Store(StoreError::Conflict(_)) => "conflict",
            ReconcileError::Store(StoreError::Transient(_)) => "transient",
            ReconcileError::MalformedKey(_) => "malformed_key",
            ReconcileError::PermanentFailure { .. } => "permanent",
        }
    }
}

/// Severity of an audit event attached to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}
