//! Deduplicating, rate-limited work queue.
//!
//! The queue holds a *set* of pending items handed out in arrival order. An
//! item that is handed to a worker stays in the processing set until the
//! worker calls [`WorkQueue::done`]; adding it again in the meantime only
//! marks it dirty, and it is queued once more when the worker is done. No
//! item is ever held by two workers at once.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, RetryConfig};
use crate::rate_limiter::{default_controller_rate_limiter, RateLimiter};

struct State<T> {
    queue: VecDeque<T>,
    // everything that needs processing, queued or not
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    item_added: Notify,
    processing_drained: Notify,
    rate_limiter: Box<dyn RateLimiter<T>>,
    max_retries: u32,
    timers: CancellationToken,
}

pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // every mutation below leaves the sets consistent before it can panic
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// `max_retries` is the number of failures a consumer tolerates per item
    /// before giving up on it, see [`max_retries`](Self::max_retries).
    pub fn new<R>(rate_limiter: R, max_retries: u32) -> Self
    where
        R: RateLimiter<T> + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                item_added: Notify::new(),
                processing_drained: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
                max_retries,
                timers: CancellationToken::new(),
            }),
        }
    }

    /// Queue backed by [`default_controller_rate_limiter`], giving up on an
    /// item after `config.max_retries` failures.
    pub fn with_retry_config(config: &RetryConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            default_controller_rate_limiter(config)?,
            config.max_retries,
        ))
    }

    /// Marks `item` as needing processing. A no-op if it is already queued or
    /// the queue is shutting down.
    pub fn add(&self, item: T) {
        let mut state = self.inner.lock();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            tracing::trace!("item in flight, deferring until done");
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.item_added.notify_one();
    }

    /// Waits for the next item. `None` means the queue was shut down and has
    /// nothing left to hand out; the caller should stop.
    pub async fn get(&self) -> Option<T> {
        loop {
            let item_added = self.inner.item_added.notified();
            tokio::pin!(item_added);
            {
                let mut state = self.inner.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
                // enlisted as a waiter before unlocking, so every add that
                // follows hands its wakeup to a distinct getter
                item_added.as_mut().enable();
            }
            item_added.await;
        }
    }

    /// Releases `item`. If it was added again while being processed it goes
    /// straight back into the queue.
    pub fn done(&self, item: &T) {
        let mut state = self.inner.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.item_added.notify_one();
        } else if state.processing.is_empty() {
            drop(state);
            self.inner.processing_drained.notify_waiters();
        }
    }

    /// Adds `item` once `delay` has elapsed, without blocking the caller.
    /// Pending delayed adds are dropped on shutdown.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(error) => {
                tracing::warn!(%error, ?delay, "no runtime to schedule delayed add, adding now");
                self.add(item);
                return;
            }
        };
        let queue = self.clone();
        let timers = self.inner.timers.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = timers.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Adds `item` after the delay its rate limiter asks for.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.rate_limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Clears the retry history of `item`. It does not remove it from the queue.
    pub fn forget(&self, item: &T) {
        self.inner.rate_limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.rate_limiter.num_requeues(item)
    }

    /// Failures tolerated per item before it should be dropped.
    pub fn max_retries(&self) -> u32 {
        self.inner.max_retries
    }

    /// Stops accepting items and wakes every waiting [`get`](Self::get).
    /// Items already queued are still handed out.
    pub fn shut_down(&self) {
        let mut state = self.inner.lock();
        state.shutting_down = true;
        drop(state);
        self.inner.timers.cancel();
        self.inner.item_added.notify_waiters();
    }

    /// Like [`shut_down`](Self::shut_down), then waits until every item
    /// currently being processed has been marked done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let drained = {
                let state = self.inner.lock();
                if state.processing.is_empty() {
                    return;
                }
                self.inner.processing_drained.notified()
            };
            drained.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::rate_limiter::ItemExponentialFailureRateLimiter;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(10), Duration::from_secs(1)),
            3,
        )
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let queue = queue();
        queue.add("default/a");
        queue.add("default/b");
        queue.add("default/a");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("default/a"));
        assert_eq!(queue.get().await, Some("default/b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn add_while_processing_is_redelivered_after_done() {
        let queue = queue();
        queue.add("k");
        let item = queue.get().await.unwrap();

        queue.add("k");
        queue.add("k");
        assert_eq!(queue.len(), 0, "in-flight item must not be handed out twice");

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("k"));
        queue.done(&"k");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn done_without_readd_does_not_requeue() {
        let queue = queue();
        queue.add("k");
        let item = queue.get().await.unwrap();
        queue.done(&item);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let queue = queue();
        let getters: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::task::yield_now().await;

        queue.shut_down();
        for getter in getters {
            let got = timeout(Duration::from_secs(1), getter).await.unwrap().unwrap();
            assert_eq!(got, None);
        }
        assert_eq!(timeout(Duration::from_secs(1), queue.get()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_hands_out_remaining_items_first() {
        let queue = queue();
        queue.add("a");
        queue.shut_down();
        queue.add("b");
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn blocked_getter_receives_later_add() {
        let queue = queue();
        let getter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add("late");
        let got = timeout(Duration::from_secs(1), getter).await.unwrap().unwrap();
        assert_eq!(got, Some("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn add_rate_limited_waits_for_backoff() {
        let queue = queue();
        queue.add_rate_limited("k");
        assert_eq!(queue.num_requeues(&"k"), 1);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.len(), 1);

        queue.forget(&"k");
        assert_eq!(queue.num_requeues(&"k"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_timers_are_dropped_on_shutdown() {
        let queue = queue();
        queue.add_after("k", Duration::from_secs(5));
        queue.shut_down();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(queue.is_empty());
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn shut_down_with_drain_waits_for_in_flight_items() {
        let queue = queue();
        queue.add("k");
        let item = queue.get().await.unwrap();

        let drain = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.shut_down_with_drain().await })
        };
        tokio::task::yield_now().await;
        assert!(!drain.is_finished());

        queue.done(&item);
        timeout(Duration::from_secs(1), drain).await.unwrap().unwrap();
        assert!(queue.is_shutting_down());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_wake_every_idle_getter() {
        const GETTERS: usize = 8;
        let queue = WorkQueue::<String>::new(
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(10), Duration::from_secs(1)),
            3,
        );
        for round in 0..200 {
            let getters: Vec<_> = (0..GETTERS)
                .map(|_| {
                    let queue = queue.clone();
                    tokio::spawn(async move { queue.get().await })
                })
                .collect();
            tokio::task::yield_now().await;

            let mut items: Vec<_> = (0..GETTERS).map(|i| format!("{}/{}", round, i)).collect();
            for item in &items {
                queue.add(item.clone());
            }

            // getters never call done, so a lost wakeup leaves one of them
            // parked next to a queued item
            let mut got = Vec::with_capacity(GETTERS);
            for getter in getters {
                let item = timeout(Duration::from_secs(5), getter)
                    .await
                    .expect("idle getter missed a wakeup")
                    .unwrap()
                    .unwrap();
                got.push(item);
            }
            got.sort();
            items.sort();
            assert_eq!(got, items);
            for item in &got {
                queue.done(item);
            }
        }
    }

    #[tokio::test]
    async fn retry_config_sets_ceiling_and_survives_tiny_rates() {
        let config = RetryConfig {
            max_retries: 2,
            qps: 1e-300,
            burst: 1,
            ..RetryConfig::default()
        };
        let queue = WorkQueue::<&str>::with_retry_config(&config).unwrap();
        assert_eq!(queue.max_retries(), 2);

        // the second requeue goes into effectively unbounded bucket debt
        queue.add_rate_limited("a");
        queue.add_rate_limited("b");
        assert_eq!(queue.num_requeues(&"b"), 1);
        assert!(queue.is_empty());
        queue.shut_down();

        let broken = RetryConfig {
            qps: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(
            WorkQueue::<&str>::with_retry_config(&broken).unwrap_err(),
            ConfigError::InvalidQps(0.0)
        );
    }
}
