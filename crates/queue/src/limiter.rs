//! Per-item and overall rate limiters deciding how long a failed key waits
//! before it becomes available again.

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::warn;

use crate::backoff::exponential;

pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` may be retried; records one more failure.
    fn when(&self, item: &T) -> Duration;
    /// Stop tracking `item`: its next failure starts from scratch.
    fn forget(&self, item: &T);
    /// Failures recorded for `item` since the last `forget`.
    fn num_requeues(&self, item: &T) -> u32;
}

fn lock<S>(m: &Mutex<S>) -> MutexGuard<'_, S> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// `base * 2^failures`, capped at `max`, tracked per item.
pub struct ItemExponentialLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<T, u32>>,
}

impl<T: Eq + Hash> ItemExponentialLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<T> RateLimiter<T> for ItemExponentialLimiter<T>
where
    T: Eq + Hash + Clone + Send,
{
    fn when(&self, item: &T) -> Duration {
        let mut failures = lock(&self.failures);
        let n = failures.entry(item.clone()).or_insert(0);
        let delay = exponential(self.base, self.max, *n);
        *n = n.saturating_add(1);
        delay
    }

    fn forget(&self, item: &T) { lock(&self.failures).remove(item); }

    fn num_requeues(&self, item: &T) -> u32 { lock(&self.failures).get(item).copied().unwrap_or(0) }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Longest wait the token bucket hands out on its own.
const MAX_BUCKET_WAIT: Duration = Duration::from_secs(1000);

/// Overall token bucket: `qps` sustained, bursts up to `burst`. Not per item,
/// so it never counts requeues.
pub struct TokenBucketLimiter {
    /// `None` when the configured rate is unusable; the bucket then never delays.
    qps: Option<f64>,
    burst: f64,
    bucket: Mutex<Bucket>,
}

/// A rate the bucket can divide by.
pub fn is_valid_qps(qps: f64) -> bool { qps.is_finite() && qps > 0.0 }

impl TokenBucketLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        let qps = if is_valid_qps(qps) {
            Some(qps)
        } else {
            warn!(qps, "token bucket rate must be positive and finite, overall limit disabled");
            None
        };
        Self { qps, burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }

    /// Reserve one token and report how long the caller must wait for it.
    fn reserve(&self) -> Duration {
        let Some(qps) = self.qps else { return Duration::ZERO };
        let mut b = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        b.last = now;
        b.tokens = (b.tokens + elapsed * qps).min(self.burst) - 1.0;
        if b.tokens >= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(-b.tokens / qps).unwrap_or(MAX_BUCKET_WAIT).min(MAX_BUCKET_WAIT)
    }
}

impl<T> RateLimiter<T> for TokenBucketLimiter {
    fn when(&self, _item: &T) -> Duration { self.reserve() }
    fn forget(&self, _item: &T) {}
    fn num_requeues(&self, _item: &T) -> u32 { 0 }
}

/// Worst case of several limiters.
///
/// Delays handed to one item never shrink until it is forgotten, even when a
/// shared limiter (the token bucket) has refilled in between, and never exceed
/// the ceiling.
pub struct MaxOfLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
    ceiling: Duration,
    last: Mutex<FxHashMap<T, Duration>>,
}

impl<T: Eq + Hash> MaxOfLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters, ceiling: Duration::MAX, last: Mutex::new(FxHashMap::default()) }
    }

    /// Cap every delay at `ceiling`.
    pub fn ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }
}

impl<T> RateLimiter<T> for MaxOfLimiter<T>
where
    T: Eq + Hash + Clone + Send,
{
    fn when(&self, item: &T) -> Duration {
        let worst = self.limiters.iter().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO);
        let mut last = lock(&self.last);
        let prev = last.entry(item.clone()).or_insert(Duration::ZERO);
        *prev = worst.max(*prev).min(self.ceiling);
        *prev
    }

    fn forget(&self, item: &T) {
        lock(&self.last).remove(item);
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }
}

/// Per-item exponential backoff from 5ms to 1000s, combined with an overall
/// 10 qps / 100 burst bucket.
pub fn default_controller_limiter<T>() -> MaxOfLimiter<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    controller_limiter(Duration::from_millis(5), Duration::from_secs(1000), 10.0, 100)
}

pub fn controller_limiter<T>(base: Duration, max: Duration, qps: f64, burst: u32) -> MaxOfLimiter<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    MaxOfLimiter::new(vec![
        Box::new(ItemExponentialLimiter::new(base, max)),
        Box::new(TokenBucketLimiter::new(qps, burst)),
    ])
    .ceiling(max)
}
