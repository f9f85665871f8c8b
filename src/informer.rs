//! Event source: turns watch events into cache writes and queued keys.
//!
//! Watch events arrive as [`Notification`]s over a channel and are handled by
//! one [`Informer`]. For every event the cache is written first and the key is
//! queued second, so a worker that dequeues a key always sees a snapshot at
//! least as new as the event that queued it.

use std::fmt::Debug;

use futures_util::stream::{Stream, StreamExt};
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use kube::Resource;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::cache::{CacheError, Writer};
use crate::config::InformerConfig;
use crate::key::ObjectKey;
use crate::queue::WorkQueue;

#[derive(Debug)]
pub enum Notification<K> {
    /// Object created or changed.
    Apply(K),
    /// Object removed, carrying its last known state.
    Delete(K),
    /// Full listing, sent first and again whenever the watch restarts.
    Relist(Vec<K>),
    /// The source gave up.
    Fatal(String),
}

pub struct Informer<K> {
    writer: Writer<K>,
    queue: WorkQueue<ObjectKey>,
}

impl<K> Informer<K>
where
    K: Resource + Debug,
{
    pub fn new(writer: Writer<K>, queue: WorkQueue<ObjectKey>) -> Self {
        Self { writer, queue }
    }

    /// Drains `notifications` until every sender is gone.
    pub async fn run(mut self, mut notifications: mpsc::Receiver<Notification<K>>) {
        while let Some(notification) = notifications.recv().await {
            if let Err(error) = self.handle(notification) {
                tracing::error!(%error, "failed to update cache");
            }
        }
        tracing::debug!("event source closed");
    }

    pub fn handle(&mut self, notification: Notification<K>) -> Result<(), CacheError> {
        match notification {
            Notification::Apply(obj) => self.on_apply(obj),
            Notification::Delete(obj) => self.on_delete(obj),
            Notification::Relist(objs) => self.on_relist(objs),
            Notification::Fatal(reason) => {
                if self.writer.mark_failed(reason.as_str()) {
                    tracing::error!(%reason, "event source failed before initial sync");
                } else {
                    tracing::warn!(%reason, "event source failed after sync");
                }
                Ok(())
            }
        }
    }

    fn on_apply(&mut self, obj: K) -> Result<(), CacheError> {
        let key = match ObjectKey::for_resource(&obj) {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!(%error, ?obj, "skipping object without identity");
                return Ok(());
            }
        };
        match self.writer.apply(key.clone(), obj)? {
            None => tracing::debug!(%key, "added"),
            Some(_) => tracing::debug!(%key, "updated"),
        }
        self.queue.add(key);
        Ok(())
    }

    fn on_delete(&mut self, obj: K) -> Result<(), CacheError> {
        let key = match ObjectKey::for_resource(&obj) {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!(%error, ?obj, "skipping deleted object without identity");
                return Ok(());
            }
        };
        self.writer.delete(&key)?;
        tracing::debug!(%key, "deleted");
        self.queue.add(key);
        Ok(())
    }

    fn on_relist(&mut self, objs: Vec<K>) -> Result<(), CacheError> {
        let mut listing = Vec::with_capacity(objs.len());
        for obj in objs {
            match ObjectKey::for_resource(&obj) {
                Ok(key) => listing.push((key, obj)),
                Err(error) => tracing::warn!(%error, ?obj, "skipping listed object without identity"),
            }
        }
        let listed: Vec<_> = listing.iter().map(|(key, _)| key.clone()).collect();
        let vanished = self.writer.replace(listing)?;

        for key in &vanished {
            tracing::debug!(%key, "deleted while unwatched");
        }
        for key in listed.iter().chain(&vanished) {
            self.queue.add(key.clone());
        }

        if !self.writer.is_synced() {
            self.writer.mark_synced();
            tracing::info!(objects = listed.len(), "cache synced");
        } else {
            tracing::info!(
                objects = listed.len(),
                vanished = vanished.len(),
                "cache relisted"
            );
        }
        Ok(())
    }
}

/// Feeds `notifications` from a kube watch on `api`. Returns when the
/// receiving side is gone or the initial listing failed for good.
pub async fn watch_resource<K>(
    api: Api<K>,
    list_params: ListParams,
    notifications: mpsc::Sender<Notification<K>>,
    config: InformerConfig,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    forward_events(watcher(api, list_params), notifications, config).await;
}

/// Translates watcher events into notifications.
///
/// Before the first listing, `config.initial_list_attempts` consecutive
/// errors end the stream with [`Notification::Fatal`]. Once a listing went
/// through, errors are only logged and the watch is resumed after
/// `config.watch_retry_delay`.
pub async fn forward_events<K, S>(
    events: S,
    notifications: mpsc::Sender<Notification<K>>,
    config: InformerConfig,
) where
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
{
    tokio::pin!(events);
    let mut synced = false;
    let mut failures = 0u32;

    while let Some(event) = events.next().await {
        let notification = match event {
            Ok(watcher::Event::Applied(obj)) => Notification::Apply(obj),
            Ok(watcher::Event::Deleted(obj)) => Notification::Delete(obj),
            Ok(watcher::Event::Restarted(objs)) => {
                synced = true;
                failures = 0;
                Notification::Relist(objs)
            }
            Err(error) if synced => {
                tracing::warn!(%error, "watch failed, retrying");
                tokio::time::sleep(config.watch_retry_delay).await;
                continue;
            }
            Err(error) => {
                failures = failures.saturating_add(1);
                tracing::warn!(%error, attempt = failures, "initial list failed");
                if failures >= config.initial_list_attempts {
                    let _ = notifications
                        .send(Notification::Fatal(error.to_string()))
                        .await;
                    return;
                }
                tokio::time::sleep(config.watch_retry_delay).await;
                continue;
            }
        };
        if notifications.send(notification).await.is_err() {
            tracing::debug!("informer gone, stopping watch");
            return;
        }
    }
}
