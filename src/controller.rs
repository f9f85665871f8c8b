//! Worker pool driving reconciliation from the work queue.
//!
//! Each worker loops: take a key, read the object from the cache, hand both to
//! the reconciler, then either forget the key (success), requeue it with
//! backoff (failure below the queue's retry ceiling) or drop it (ceiling
//! reached).
//! The queue guarantees one worker per key, so reconcilers need no locking of
//! their own, but they must be idempotent: a key is retried from scratch after
//! a partial failure.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::{join_all, FutureExt};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::cache::{Indexer, Lookup, SyncOutcome};
use crate::config::ConfigError;
use crate::error::{Error, ReconcileError};
use crate::key::ObjectKey;
use crate::queue::WorkQueue;

pub struct Controller<K, R, Ctx> {
    queue: WorkQueue<ObjectKey>,
    indexer: Indexer<K>,
    reconcile: R,
    context: Arc<Ctx>,
}

impl<K, R, Ctx, Fut, E> Controller<K, R, Ctx>
where
    K: Send + Sync + 'static,
    Ctx: Send + Sync + 'static,
    R: Fn(ObjectKey, Lookup<K>, Arc<Ctx>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// `reconcile` receives the key, the cached object (or
    /// [`Lookup::Absent`] once it is gone) and the shared context. Failing
    /// keys are dropped after [`WorkQueue::max_retries`] retries.
    pub fn new(
        queue: WorkQueue<ObjectKey>,
        indexer: Indexer<K>,
        reconcile: R,
        context: Arc<Ctx>,
    ) -> Self {
        Self {
            queue,
            indexer,
            reconcile,
            context,
        }
    }

    /// Waits for the initial cache sync, then runs `workers` workers until
    /// `stop` fires or the queue is shut down. In-flight reconciles are
    /// allowed to finish.
    pub async fn run(self, workers: usize, stop: CancellationToken) -> Result<(), Error> {
        if workers == 0 {
            return Err(ConfigError::NoWorkers.into());
        }
        match self.indexer.wait_for_initial_sync(&stop).await {
            Ok(SyncOutcome::Synced) => {}
            Ok(SyncOutcome::Stopped) => {
                tracing::info!("stopped before cache sync");
                self.queue.shut_down();
                return Ok(());
            }
            Err(error) => {
                self.queue.shut_down();
                return Err(Error::InitialSync(error));
            }
        }

        tracing::info!(workers, "starting workers");
        let controller = Arc::new(self);
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let controller = Arc::clone(&controller);
                tokio::spawn(
                    async move {
                        while controller.process_next_item().await {}
                        tracing::debug!("worker stopped");
                    }
                    .instrument(tracing::info_span!("worker", worker)),
                )
            })
            .collect();

        let pool = join_all(handles);
        tokio::pin!(pool);
        let results = tokio::select! {
            results = &mut pool => results,
            _ = stop.cancelled() => {
                tracing::info!("shutting down workers");
                controller.queue.shut_down_with_drain().await;
                pool.await
            }
        };
        controller.queue.shut_down();

        let mut failure = None;
        for result in results {
            if let Err(error) = result {
                tracing::error!(%error, "worker task failed");
                if failure.is_none() {
                    failure = Some(Error::WorkerFailed(error));
                }
            }
        }
        tracing::info!("controller terminated");
        failure.map_or(Ok(()), Err)
    }

    /// One pass of the worker loop. `false` once the queue is shut down.
    async fn process_next_item(&self) -> bool {
        let key = match self.queue.get().await {
            Some(key) => key,
            None => return false,
        };
        let span = tracing::info_span!("reconcile", %key);
        let result = self.sync(&key).instrument(span.clone()).await;
        span.in_scope(|| self.handle_result(&key, result));
        self.queue.done(&key);
        true
    }

    async fn sync(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        let lookup = self.indexer.get_by_key(key).map_err(ReconcileError::Lookup)?;
        let attempt =
            async { (self.reconcile)(key.clone(), lookup, Arc::clone(&self.context)).await };
        match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(result) => result.map_err(|error| ReconcileError::Reconciler(Box::new(error))),
            Err(panic) => Err(ReconcileError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    fn handle_result(&self, key: &ObjectKey, result: Result<(), ReconcileError>) {
        let error = match result {
            Ok(()) => {
                self.queue.forget(key);
                tracing::debug!("reconciled");
                return;
            }
            Err(error) => error,
        };

        let retries = self.queue.num_requeues(key);
        if retries < self.queue.max_retries() {
            tracing::warn!(
                %error,
                retry = retries.saturating_add(1),
                "reconcile failed, requeueing"
            );
            self.queue.add_rate_limited(key.clone());
        } else {
            self.queue.forget(key);
            tracing::warn!(%error, retries, "dropping key out of the queue");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
