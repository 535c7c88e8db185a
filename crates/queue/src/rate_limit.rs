//! Per-item and overall requeue delays.

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
pub const DEFAULT_QPS: f64 = 10.0;
pub const DEFAULT_BURST: u32 = 100;

/// Decides how long an item waits before it is re-added.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next requeue of `item`; records one more failure.
    fn when(&self, item: &T) -> Duration;
    /// Clear failure history for `item`.
    fn forget(&self, item: &T);
    /// Failures recorded for `item` since the last `forget`.
    fn num_requeues(&self, item: &T) -> u32;
}

fn lock<S>(m: &Mutex<S>) -> MutexGuard<'_, S> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailure<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<T, u32>>,
}

impl<T> ItemExponentialFailure<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<T: Eq + Hash + Clone + Send> RateLimiter<T> for ItemExponentialFailure<T> {
    fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut failures = lock(&self.failures);
            let n = failures.entry(item.clone()).or_insert(0);
            let exp = *n;
            *n = n.saturating_add(1);
            exp
        };
        1u32.checked_shl(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }

    fn forget(&self, item: &T) { lock(&self.failures).remove(item); }

    fn num_requeues(&self, item: &T) -> u32 { lock(&self.failures).get(item).copied().unwrap_or(0) }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every item. Tokens are reserved up front,
/// so a burst beyond capacity spreads out at `qps`. A `qps` that is not a
/// positive finite number disables the bucket.
pub struct TokenBucket {
    qps: Option<f64>,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        let qps = (qps.is_finite() && qps > 0.0).then_some(qps);
        Self { qps, burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }

    pub fn is_unlimited(&self) -> bool { self.qps.is_none() }
}

impl<T> RateLimiter<T> for TokenBucket {
    fn when(&self, _item: &T) -> Duration {
        let Some(qps) = self.qps else { return Duration::ZERO };
        let mut b = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        b.tokens = (b.tokens + elapsed * qps).min(self.burst);
        b.last = now;
        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(-b.tokens / qps).map_or(DEFAULT_MAX_DELAY, |d| d.min(DEFAULT_MAX_DELAY))
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 { 0 }
}

/// Worst case of several limiters.
pub struct MaxOf<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOf<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self { Self { limiters } }
}

impl<T> RateLimiter<T> for MaxOf<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters.iter().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }
}

/// Per-item exponential backoff (5ms doubling to 1000s) combined with an
/// overall 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<T>() -> MaxOf<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOf::new(vec![
        Box::new(ItemExponentialFailure::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)),
        Box::new(TokenBucket::new(DEFAULT_QPS, DEFAULT_BURST)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_and_caps() {
        let rl = ItemExponentialFailure::new(Duration::from_millis(5), Duration::from_secs(1));
        let delays: Vec<_> = (0..4).map(|_| rl.when(&"a")).collect();
        assert_eq!(
            delays,
            [5, 10, 20, 40].map(Duration::from_millis).to_vec()
        );
        assert_eq!(rl.num_requeues(&"a"), 4);
        assert_eq!(rl.num_requeues(&"b"), 0);
        for _ in 0..20 {
            rl.when(&"a");
        }
        assert_eq!(rl.when(&"a"), Duration::from_secs(1));
        rl.forget(&"a");
        assert_eq!(rl.num_requeues(&"a"), 0);
        assert_eq!(rl.when(&"a"), Duration::from_millis(5));
    }

    #[test]
    fn exponential_survives_huge_exponents() {
        let rl = ItemExponentialFailure::new(Duration::from_millis(5), Duration::from_secs(1000));
        lock(&rl.failures).insert("a", u32::MAX);
        assert_eq!(rl.when(&"a"), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_spaces_out() {
        let rl = TokenBucket::new(10.0, 3);
        for _ in 0..3 {
            assert_eq!(RateLimiter::<&str>::when(&rl, &"x"), Duration::ZERO);
        }
        let d = RateLimiter::<&str>::when(&rl, &"x");
        assert!(d > Duration::from_millis(90) && d <= Duration::from_millis(100), "{d:?}");
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(RateLimiter::<&str>::when(&rl, &"x"), Duration::ZERO);
    }

    #[test]
    fn zero_or_invalid_qps_disables_the_bucket() {
        for qps in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let rl = TokenBucket::new(qps, 1);
            assert!(rl.is_unlimited(), "{qps}");
            for _ in 0..5 {
                assert_eq!(RateLimiter::<&str>::when(&rl, &"x"), Duration::ZERO);
            }
        }
    }

    #[test]
    fn tiny_qps_waits_at_most_the_max_delay() {
        let rl = TokenBucket::new(f64::MIN_POSITIVE, 1);
        assert!(!rl.is_unlimited());
        assert_eq!(RateLimiter::<&str>::when(&rl, &"x"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&rl, &"x"), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn max_of_takes_the_slowest() {
        let rl = default_controller_rate_limiter::<&str>();
        assert_eq!(rl.when(&"a"), Duration::from_millis(5));
        assert_eq!(rl.when(&"a"), Duration::from_millis(10));
        assert_eq!(rl.num_requeues(&"a"), 2);
        rl.forget(&"a");
        assert_eq!(rl.num_requeues(&"a"), 0);
    }
}
