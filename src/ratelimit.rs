//! Requeue delay policies.
//!
//! A [`RateLimiter`] decides how long a key should wait before it is
//! retried. The queue consults it for `add_rate_limited` and passes
//! `forget` / `num_requeues` straight through.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::{Clock, RealClock};
use crate::error::{Error, Result};

/// Per-key retry policy.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `key` should be processed again. Counts as a retry.
    fn when(&self, key: &K) -> Duration;

    /// Stop tracking `key`, resetting its retry history.
    fn forget(&self, key: &K);

    /// How many times `key` has been requeued.
    fn num_requeues(&self, key: &K) -> usize;
}

/// Default policy used by the queue: exponential per-key backoff from
/// 5ms up to 1000s.
pub fn default_rate_limiter<K>() -> Arc<dyn RateLimiter<K>>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    Arc::new(ItemExponentialFailureRateLimiter::default())
}

/// Per-key exponential backoff combined with an overall 10 qps / 100
/// burst token bucket, whichever is slower.
pub fn default_controller_rate_limiter<K>() -> Arc<dyn RateLimiter<K>>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    Arc::new(MaxOfRateLimiter::new(vec![
        Arc::new(ItemExponentialFailureRateLimiter::default()),
        Arc::new(BucketRateLimiter::from_parts(10.0, 100, Arc::new(RealClock))),
    ]))
}

// ---------------------------------------------------------------------------
// Exponential
// ---------------------------------------------------------------------------

/// `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ItemExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> Default for ItemExponentialFailureRateLimiter<K> {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl<K> RateLimiter<K> for ItemExponentialFailureRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, key: &K) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |backoff| backoff.min(self.max))
    }

    fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &K) -> usize {
        self.failures.lock().get(key).copied().unwrap_or(0) as usize
    }
}

// ---------------------------------------------------------------------------
// Fast / slow
// ---------------------------------------------------------------------------

/// Retries quickly for the first `max_fast_attempts`, then slowly.
#[derive(Debug)]
pub struct ItemFastSlowRateLimiter<K> {
    fast: Duration,
    slow: Duration,
    max_fast_attempts: usize,
    failures: Mutex<HashMap<K, usize>>,
}

impl<K> ItemFastSlowRateLimiter<K> {
    pub fn new(fast: Duration, slow: Duration, max_fast_attempts: usize) -> Self {
        Self {
            fast,
            slow,
            max_fast_attempts,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> RateLimiter<K> for ItemFastSlowRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        *count += 1;
        if *count <= self.max_fast_attempts {
            self.fast
        } else {
            self.slow
        }
    }

    fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &K) -> usize {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall (not per-key) token bucket. Each `when` reserves one token
/// and returns how long until that token is actually available.
///
/// With `qps == 0` the bucket never refills: once the burst is spent
/// every key waits [`Duration::MAX`].
pub struct BucketRateLimiter {
    qps: f64,
    burst: u32,
    clock: Arc<dyn Clock>,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// # Errors
    ///
    /// Fails unless `qps` is finite and non-negative.
    pub fn new(qps: f64, burst: u32) -> Result<Self> {
        Self::with_clock(qps, burst, Arc::new(RealClock))
    }

    /// Same as [`new`](Self::new) with an injected clock.
    pub fn with_clock(qps: f64, burst: u32, clock: Arc<dyn Clock>) -> Result<Self> {
        if !qps.is_finite() || qps < 0.0 {
            return Err(Error::Config(format!(
                "bucket rate limiter qps must be finite and non-negative, got {qps}"
            )));
        }
        Ok(Self::from_parts(qps, burst, clock))
    }

    fn from_parts(qps: f64, burst: u32, clock: Arc<dyn Clock>) -> Self {
        let bucket = Bucket {
            tokens: f64::from(burst),
            last: clock.now(),
        };
        Self {
            qps,
            burst,
            clock,
            bucket: Mutex::new(bucket),
        }
    }

    fn reserve(&self) -> Duration {
        let now = self.clock.now();
        let mut bucket = self.bucket.lock();

        let elapsed = now.saturating_duration_since(bucket.last);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.qps).min(f64::from(self.burst));
        if now > bucket.last {
            bucket.last = now;
        }

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            return Duration::ZERO;
        }
        // Saturates when the wait does not fit a Duration (tiny or zero qps).
        Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
    }
}

impl std::fmt::Debug for BucketRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketRateLimiter")
            .field("qps", &self.qps)
            .field("burst", &self.burst)
            .finish()
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        self.reserve()
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> usize {
        0
    }
}

// ---------------------------------------------------------------------------
// Max-of
// ---------------------------------------------------------------------------

/// Combines limiters by taking the worst (longest) answer.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Arc<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Arc<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K>
where
    K: Send + Sync,
{
    fn when(&self, key: &K) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> usize {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}
