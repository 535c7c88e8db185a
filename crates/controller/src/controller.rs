//! Wiring: caches, watchers, router, worker pool and shutdown.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Result};
use futures::FutureExt;
use kube::Resource;
use steward_core::{Notification, ObjectKey, ReconcileError, StoreError};
use steward_kubehub::{start_watcher, EventSink, Object, ResourceApi};
use steward_queue::WorkQueue;
use steward_store::{spawn_ingest, wait_for_cache_sync, Cache, Handler};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::reconcile::{Dependent, Managed, Primary, Reconciler, Template};
use crate::retry::{FailureReport, RetryDecision, RetryPolicy};
use crate::router::{Change, Router, Signal};

/// Collects dependent kinds, then starts caches and watchers on `build`.
/// Must be used inside a tokio runtime.
pub struct ControllerBuilder<P: Primary> {
    name: String,
    config: ControllerConfig,
    api: Arc<dyn ResourceApi<P>>,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
    queue: WorkQueue<ObjectKey>,
    router: Arc<Router<P>>,
    dependents: Vec<Box<dyn Dependent<P>>>,
    synced: Vec<watch::Receiver<bool>>,
}

impl<P: Primary> ControllerBuilder<P> {
    pub fn new(
        name: impl Into<String>,
        config: ControllerConfig,
        api: Arc<dyn ResourceApi<P>>,
        events: Arc<dyn EventSink>,
        shutdown: CancellationToken,
    ) -> Self {
        let name = name.into();
        let queue = WorkQueue::new(name.clone(), Box::new(config.rate_limiter()));
        let router = Arc::new(Router::new(queue.clone()));
        Self { name, config, api, events, shutdown, queue, router, dependents: Vec::new(), synced: Vec::new() }
    }

    /// Manage one dependent kind rendered by `template`.
    pub fn owns<T: Template<P>>(mut self, template: T, api: Arc<dyn ResourceApi<T::Object>>) -> Self {
        let router = Arc::clone(&self.router);
        let kind = <T::Object as Resource>::kind(&()).to_string();
        let handler: Arc<dyn Handler<T::Object>> = Arc::new(move |n: Notification<T::Object>| {
            router.route(Signal::Dependent { kind: &kind, change: Change::of(&n), meta: n.object().meta() });
        });
        let cache = self.watch(Arc::clone(&api), handler);
        self.dependents.push(Box::new(Managed::new(template, cache, api)));
        self
    }

    fn watch<K: Object>(&mut self, api: Arc<dyn ResourceApi<K>>, handler: Arc<dyn Handler<K>>) -> Cache<K> {
        let (tx, cache) = spawn_ingest(self.config.ingest_capacity, Some(handler));
        tokio::spawn(start_watcher(api, tx, self.shutdown.clone()));
        self.synced.push(cache.synced());
        cache
    }

    pub fn build(mut self) -> Controller<P> {
        let router = Arc::clone(&self.router);
        let handler: Arc<dyn Handler<P>> = Arc::new(move |n: Notification<P>| {
            router.route(Signal::Primary(&n));
        });
        let cache = self.watch(Arc::clone(&self.api), handler);
        let reconciler = Reconciler::new(self.name.clone(), cache.clone(), self.api, self.dependents, self.events);
        let (fail_tx, fail_rx) = mpsc::unbounded_channel();
        let retry = RetryPolicy::new(self.name.clone(), self.config.max_retries, fail_tx);
        Controller {
            name: self.name,
            config: self.config,
            queue: self.queue,
            reconciler: Arc::new(reconciler),
            retry: Arc::new(retry),
            cache,
            synced: self.synced,
            failures: Mutex::new(Some(fail_rx)),
            shutdown: self.shutdown,
        }
    }
}

pub struct Controller<P: Primary> {
    name: String,
    config: ControllerConfig,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<Reconciler<P>>,
    retry: Arc<RetryPolicy>,
    cache: Cache<P>,
    synced: Vec<watch::Receiver<bool>>,
    failures: Mutex<Option<mpsc::UnboundedReceiver<FailureReport>>>,
    shutdown: CancellationToken,
}

impl<P: Primary> Controller<P> {
    pub fn name(&self) -> &str { &self.name }
    pub fn queue(&self) -> &WorkQueue<ObjectKey> { &self.queue }
    pub fn cache(&self) -> &Cache<P> { &self.cache }
    pub fn reconciler(&self) -> Arc<Reconciler<P>> { Arc::clone(&self.reconciler) }

    /// Receiver of abandoned keys. Only the first caller gets it.
    pub fn failures(&self) -> Option<mpsc::UnboundedReceiver<FailureReport>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Wait until the primary and every dependent cache have listed.
    pub async fn wait_for_sync(&self) -> bool { wait_for_cache_sync(&self.synced, &self.shutdown).await }

    /// Run until the shutdown token fires. Workers start only after every
    /// cache synced; in-flight passes finish before this returns.
    pub async fn run(&self) -> Result<()> {
        info!(controller = %self.name, workers = self.config.workers, "starting controller");
        if !self.wait_for_sync().await {
            if self.shutdown.is_cancelled() {
                info!(controller = %self.name, "shutdown before caches synced");
                return Ok(());
            }
            bail!("{}: caches closed before syncing", self.name);
        }
        info!(controller = %self.name, "caches synced; starting workers");

        let mut tasks = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            tasks.spawn(worker(id, self.queue.clone(), Arc::clone(&self.reconciler), Arc::clone(&self.retry)));
        }
        if let Some(period) = self.config.resync {
            tasks.spawn(resync(self.cache.clone(), self.queue.clone(), period, self.shutdown.clone()));
        }

        self.shutdown.cancelled().await;
        info!(controller = %self.name, "shutting down workers");
        self.queue.shut_down();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(controller = %self.name, error = %e, "controller task failed");
            }
        }
        info!(controller = %self.name, "controller stopped");
        Ok(())
    }
}

/// Marks a key done when dropped, so a panic past the reconcile pass cannot
/// leave the key stuck in processing.
struct Processing<'a> {
    queue: &'a WorkQueue<ObjectKey>,
    key: ObjectKey,
}

impl Drop for Processing<'_> {
    fn drop(&mut self) { self.queue.done(&self.key); }
}

async fn worker<P: Primary>(
    id: usize,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<Reconciler<P>>,
    retry: Arc<RetryPolicy>,
) {
    debug!(worker = id, queue = %queue.name(), "worker started");
    while let Some(key) = queue.get().await {
        let item = Processing { queue: &queue, key };
        let key = &item.key;
        let result = match AssertUnwindSafe(reconciler.reconcile(key)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic_message(&*panic);
                error!(worker = id, key = %key, panic = %msg, "reconcile panicked");
                Err(ReconcileError::Store(StoreError::Transient(format!("reconcile panicked: {msg}"))))
            }
        };
        if let Some(RetryDecision::Abandoned { message, .. }) = settle(&queue, &retry, key, result) {
            reconciler.report_abandoned(key, message).await;
        }
    }
    debug!(worker = id, queue = %queue.name(), "worker stopped");
}

/// Apply the retry policy; `None` when it panicked.
fn settle(
    queue: &WorkQueue<ObjectKey>,
    retry: &RetryPolicy,
    key: &ObjectKey,
    result: Result<(), ReconcileError>,
) -> Option<RetryDecision> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| retry.handle(queue, key, result))) {
        Ok(decision) => Some(decision),
        Err(panic) => {
            error!(key = %key, panic = %panic_message(&*panic), "retry handling panicked");
            None
        }
    }
}

async fn resync<P: Primary>(
    cache: Cache<P>,
    queue: WorkQueue<ObjectKey>,
    period: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately; startup already enqueued everything
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let keys = cache.keys();
                debug!(kind = %P::kind(&()), count = keys.len(), "resync");
                for key in keys {
                    queue.add(key);
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
