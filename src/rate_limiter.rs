//! Requeue delay policies.
//!
//! A limiter decides how long a failed item waits before it is handed out
//! again. Per-item exponential backoff keeps a single hot key from spinning;
//! the token bucket bounds the aggregate requeue rate so a storm of distinct
//! keys cannot flood the reconciler. The controller default takes the larger
//! of the two delays.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{validate_bucket, ConfigError, RetryConfig};

pub trait RateLimiter<T>: Send + Sync {
    /// Records a failure of `item` and returns how long it has to wait.
    fn when(&self, item: &T) -> Duration;

    /// Drops all history for `item`.
    fn forget(&self, item: &T);

    /// Consecutive failures recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &T) -> u32;
}

// Limiter state is plain bookkeeping, a panic elsewhere cannot leave it torn.
fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter<T> {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemExponentialFailureRateLimiter<T> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

fn exponential_backoff(base: Duration, max: Duration, exponent: u32) -> Duration {
    1u32.checked_shl(exponent)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

impl<T> RateLimiter<T> for ItemExponentialFailureRateLimiter<T>
where
    T: Eq + Hash + Clone + Send + Sync,
{
    fn when(&self, item: &T) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(item.clone()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);
        exponential_backoff(self.base_delay, self.max_delay, exponent)
    }

    fn forget(&self, item: &T) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Global token bucket. Every `when` reserves one token; once the bucket is
/// empty the reservation goes into debt and the caller waits until the
/// token would have been minted. Debt too large to express as a
/// [`Duration`] saturates at [`Duration::MAX`].
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Fails unless `qps` is positive and finite and `burst` is at least 1.
    pub fn new(qps: f64, burst: u32) -> Result<Self, ConfigError> {
        validate_bucket(qps, burst)?;
        let burst = f64::from(burst);
        Ok(Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        })
    }

    fn reserve(&self) -> Duration {
        let now = Instant::now();
        let mut bucket = lock(&self.bucket);
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Worst case of several limiters.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        // every limiter has to observe the failure, no short-circuiting
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key exponential backoff combined with the global bucket.
pub fn default_controller_rate_limiter<T>(
    config: &RetryConfig,
) -> Result<MaxOfRateLimiter<T>, ConfigError>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    config.validate()?;
    Ok(MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            config.base_delay,
            config.max_delay,
        )),
        Box::new(BucketRateLimiter::new(config.qps, config.burst)?),
    ]))
}
