//! Tunables for the work queue, the controller and the informer.
//!
//! Every knob has a default matching the stock client-side controller
//! behaviour: 5 retries, 5ms..1000s exponential backoff, 10 qps / 100 burst
//! for aggregate requeues.

use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
pub const DEFAULT_QPS: f64 = 10.0;
pub const DEFAULT_BURST: u32 = 100;
pub const DEFAULT_WORKERS: usize = 1;
pub const DEFAULT_INITIAL_LIST_ATTEMPTS: u32 = 5;
pub const DEFAULT_WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("base delay {base:?} exceeds max delay {max:?}")]
    DelayBounds { base: Duration, max: Duration },
    #[error("qps must be a positive finite number, got {0}")]
    InvalidQps(f64),
    #[error("burst must be at least 1")]
    ZeroBurst,
    #[error("initial list attempts must be at least 1")]
    NoListAttempts,
    #[error("notification channel capacity must be at least 1")]
    ZeroChannelCapacity,
}

/// Bounds shared by [`RetryConfig::validate`] and the token bucket itself.
pub(crate) fn validate_bucket(qps: f64, burst: u32) -> Result<(), ConfigError> {
    if !qps.is_finite() || qps <= 0.0 {
        return Err(ConfigError::InvalidQps(qps));
    }
    if burst == 0 {
        return Err(ConfigError::ZeroBurst);
    }
    Ok(())
}

/// Retry and requeue policy.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Failures tolerated before a key is dropped. A key is processed at most
    /// `max_retries + 1` times per change.
    pub max_retries: u32,
    /// Per-key backoff for the first failure, doubled on every further one.
    pub base_delay: Duration,
    /// Upper bound for the per-key backoff.
    pub max_delay: Duration,
    /// Sustained rate of requeues across all keys.
    pub qps: f64,
    /// Requeues allowed back to back before `qps` kicks in.
    pub burst: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            qps: DEFAULT_QPS,
            burst: DEFAULT_BURST,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay > self.max_delay {
            return Err(ConfigError::DelayBounds {
                base: self.base_delay,
                max: self.max_delay,
            });
        }
        validate_bucket(self.qps, self.burst)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    pub workers: usize,
    pub retry: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            retry: RetryConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        self.retry.validate()
    }
}

/// Watch-side behaviour of the kube adapter.
#[derive(Clone, Debug, PartialEq)]
pub struct InformerConfig {
    /// Consecutive errors tolerated before the first full listing; past that
    /// the source is reported as unable to ever sync.
    pub initial_list_attempts: u32,
    /// Pause after a watch error once the cache is synced.
    pub watch_retry_delay: Duration,
    /// Notifications buffered between the watcher and the dispatcher.
    pub channel_capacity: usize,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            initial_list_attempts: DEFAULT_INITIAL_LIST_ATTEMPTS,
            watch_retry_delay: DEFAULT_WATCH_RETRY_DELAY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl InformerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_list_attempts == 0 {
            return Err(ConfigError::NoListAttempts);
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroChannelCapacity);
        }
        Ok(())
    }
}
