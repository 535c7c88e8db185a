//! Retry decisions after a reconcile pass.

use steward_core::{ObjectKey, ReconcileError};
use steward_queue::WorkQueue;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// A key given up on after exhausting its retries.
#[derive(Debug)]
pub struct FailureReport {
    pub key: ObjectKey,
    pub attempts: u32,
    /// Always `ReconcileError::PermanentFailure` wrapping the last error.
    pub error: ReconcileError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Succeeded,
    /// Not retryable; history forgotten.
    Dropped,
    Requeued { attempt: u32 },
    Abandoned { attempts: u32, message: String },
}

pub struct RetryPolicy {
    controller: String,
    max_retries: u32,
    failures: mpsc::UnboundedSender<FailureReport>,
}

impl RetryPolicy {
    pub fn new(controller: impl Into<String>, max_retries: u32, failures: mpsc::UnboundedSender<FailureReport>) -> Self {
        Self { controller: controller.into(), max_retries, failures }
    }

    pub fn handle(&self, queue: &WorkQueue<ObjectKey>, key: &ObjectKey, result: Result<(), ReconcileError>) -> RetryDecision {
        let err = match result {
            Ok(()) => {
                metrics::counter!("reconcile_total", 1u64, "controller" => self.controller.clone(), "result" => "ok");
                queue.forget(key);
                return RetryDecision::Succeeded;
            }
            Err(e) => e,
        };
        metrics::counter!(
            "reconcile_errors_total",
            1u64,
            "controller" => self.controller.clone(),
            "error" => err.label()
        );
        if !err.is_retryable() {
            warn!(controller = %self.controller, key = %key, error = %err, "dropping key");
            queue.forget(key);
            return RetryDecision::Dropped;
        }
        let requeues = queue.num_requeues(key);
        if requeues < self.max_retries {
            debug!(controller = %self.controller, key = %key, attempt = requeues + 1, error = %err, "reconcile failed; retrying");
            queue.add_rate_limited(key.clone());
            return RetryDecision::Requeued { attempt: requeues + 1 };
        }

        let attempts = requeues.saturating_add(1);
        let permanent = ReconcileError::PermanentFailure { attempts, source: Box::new(err) };
        let message = permanent.to_string();
        error!(controller = %self.controller, key = %key, attempts, error = %permanent, "abandoning key");
        metrics::counter!("reconcile_total", 1u64, "controller" => self.controller.clone(), "result" => "abandoned");
        if self.failures.send(FailureReport { key: key.clone(), attempts, error: permanent }).is_err() {
            debug!(controller = %self.controller, "failure channel closed");
        }
        queue.forget(key);
        RetryDecision::Abandoned { attempts, message }
    }
}
