//! Steward controller: a level-triggered reconciliation loop.
//!
//! Watch caches feed an event router, the router feeds a deduplicating work
//! queue, and a fixed pool of workers runs reconcile passes that create or
//! delete owned dependents. Failed passes are retried with per-key backoff up
//! to a bound, then reported and dropped.
//!
//! Two controllers ship with the crate: [`ingress`] (Service → Ingress) and
//! [`app`] (App → Deployment + Service).

#![forbid(unsafe_code)]

pub mod app;
mod config;
mod controller;
pub mod ingress;
mod reconcile;
mod retry;
mod router;

pub use config::{ControllerConfig, DEFAULT_INGEST_CAPACITY, DEFAULT_MAX_RETRIES, DEFAULT_WORKERS};
pub use controller::{Controller, ControllerBuilder};
pub use reconcile::{Dependent, Managed, Primary, Reconciler, Template};
pub use retry::{FailureReport, RetryDecision, RetryPolicy};
pub use router::{Change, Router, Signal};
