//! Steward queue: a deduplicating work queue with delayed and rate-limited
//! re-adds.
//!
//! An item is queued at most once. An item added while a worker holds it is
//! marked dirty and handed out again after `done`, so no two workers ever
//! process the same item concurrently and no change is lost.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

mod rate_limit;

pub use rate_limit::{
    default_controller_rate_limiter, ItemExponentialFailure, MaxOf, RateLimiter, TokenBucket, DEFAULT_BASE_DELAY,
    DEFAULT_BURST, DEFAULT_MAX_DELAY, DEFAULT_QPS,
};

/// Bounds on queued items.
pub trait QueueItem: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T> QueueItem for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

struct State<T> {
    queue: VecDeque<T>,
    /// Items waiting to be processed (queued, or re-added while processing).
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    shutting_down: bool,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
    /// Cancels pending delayed adds on shutdown.
    shutdown: CancellationToken,
}

pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<T: QueueItem> WorkQueue<T> {
    pub fn new(name: impl Into<String>, limiter: Box<dyn RateLimiter<T>>) -> Self {
        let state = State {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            shutting_down: false,
        };
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(state),
                notify: Notify::new(),
                limiter,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn with_default_limiter(name: impl Into<String>) -> Self {
        Self::new(name, Box::new(default_controller_rate_limiter()))
    }

    pub fn name(&self) -> &str { &self.inner.name }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn depth(&self, st: &State<T>) {
        metrics::gauge!("queue_depth", st.queue.len() as f64, "queue" => self.inner.name.clone());
    }

    /// Enqueue `item` unless it is already waiting. Ignored after shutdown.
    pub fn add(&self, item: T) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        if !st.dirty.insert(item.clone()) {
            trace!(queue = %self.inner.name, item = ?item, "already queued");
            return;
        }
        metrics::counter!("queue_adds_total", 1u64, "queue" => self.inner.name.clone());
        if st.processing.contains(&item) {
            // requeued by `done`
            return;
        }
        st.queue.push_back(item);
        self.depth(&st);
        drop(st);
        self.inner.notify.notify_one();
    }

    /// Next item to process, waiting for one if needed. `None` once the queue
    /// is shut down; anything still queued at that point is dropped.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    self.depth(&st);
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Release `item` after processing; requeues it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut st = self.lock();
        st.processing.remove(item);
        if st.dirty.contains(item) && !st.shutting_down {
            st.queue.push_back(item.clone());
            self.depth(&st);
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    /// Re-add after `delay`. Pending delays are abandoned on shutdown.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        let token = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(item),
                _ = token.cancelled() => {}
            }
        });
    }

    /// Re-add once the rate limiter allows it; counts as one more failure.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.limiter.when(&item);
        debug!(queue = %self.inner.name, item = ?item, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        metrics::counter!("queue_retries_total", 1u64, "queue" => self.inner.name.clone());
        self.add_after(item, delay);
    }

    /// Reset the failure history of `item`.
    pub fn forget(&self, item: &T) { self.inner.limiter.forget(item) }

    pub fn num_requeues(&self, item: &T) -> u32 { self.inner.limiter.num_requeues(item) }

    /// Items waiting to be handed out.
    pub fn len(&self) -> usize { self.lock().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Stop handing out items and wake every waiting `get`.
    pub fn shut_down(&self) {
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            debug!(queue = %self.inner.name, dropped = st.queue.len(), "queue shutting down");
            st.queue.clear();
            st.dirty.clear();
        }
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }
}
