use std::time::Duration;

use steward_queue::{
    ItemExponentialFailure, MaxOf, QueueItem, TokenBucket, DEFAULT_BASE_DELAY, DEFAULT_BURST, DEFAULT_MAX_DELAY,
    DEFAULT_QPS,
};

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_INGEST_CAPACITY: usize = 2048;

/// Runtime knobs shared by every controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub workers: usize,
    /// Failed passes retried per key before the key is abandoned.
    pub max_retries: u32,
    /// Watch scope; `None` watches every namespace.
    pub namespace: Option<String>,
    /// Re-enqueue every cached primary this often.
    pub resync: Option<Duration>,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub qps: f64,
    pub burst: u32,
    /// Buffer between a watcher and its cache ingest loop.
    pub ingest_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            namespace: None,
            resync: None,
            retry_base: DEFAULT_BASE_DELAY,
            retry_max: DEFAULT_MAX_DELAY,
            qps: DEFAULT_QPS,
            burst: DEFAULT_BURST,
            ingest_capacity: DEFAULT_INGEST_CAPACITY,
        }
    }
}

impl ControllerConfig {
    /// Per-key exponential backoff bounded by an overall token bucket.
    pub fn rate_limiter<T: QueueItem>(&self) -> MaxOf<T> {
        MaxOf::new(vec![
            Box::new(ItemExponentialFailure::new(self.retry_base, self.retry_max)),
            Box::new(TokenBucket::new(self.qps, self.burst)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_controller_conventions() {
        let c = ControllerConfig::default();
        assert_eq!(c.workers, 5);
        assert_eq!(c.max_retries, 10);
        assert_eq!(c.retry_base, Duration::from_millis(5));
        assert_eq!(c.retry_max, Duration::from_secs(1000));
        assert_eq!((c.qps, c.burst), (10.0, 100));
        assert!(c.resync.is_none());
    }
}
