//! Local cache of the last observed state of every watched object.
//!
//! The cache is split in two halves: a single [`Writer`] owned by the event
//! source, and any number of read-only [`Indexer`] handles for the controller.
//! The writer also publishes whether the first full listing has landed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::key::ObjectKey;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache lock poisoned by a panicking writer")]
    Poisoned,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("event source failed before the initial listing: {0}")]
    Failed(String),
    #[error("event source went away before the initial listing")]
    SourceClosed,
}

/// What the cache knows about a key.
#[derive(Debug)]
pub enum Lookup<K> {
    Present(Arc<K>),
    /// Never seen, or deleted since.
    Absent,
}

impl<K> Clone for Lookup<K> {
    fn clone(&self) -> Self {
        match self {
            Lookup::Present(obj) => Lookup::Present(Arc::clone(obj)),
            Lookup::Absent => Lookup::Absent,
        }
    }
}

impl<K> Lookup<K> {
    pub fn is_present(&self) -> bool {
        matches!(self, Lookup::Present(_))
    }

    pub fn into_option(self) -> Option<Arc<K>> {
        match self {
            Lookup::Present(obj) => Some(obj),
            Lookup::Absent => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum SyncState {
    Pending,
    Synced,
    Failed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    /// The stop signal fired first.
    Stopped,
}

type Objects<K> = Arc<RwLock<HashMap<ObjectKey, Arc<K>>>>;

pub fn store<K>() -> (Writer<K>, Indexer<K>) {
    let objects: Objects<K> = Arc::default();
    let (sync_tx, sync_rx) = watch::channel(SyncState::Pending);
    let indexer = Indexer {
        objects: Arc::clone(&objects),
        sync: sync_rx,
    };
    (
        Writer {
            objects,
            sync: sync_tx,
        },
        indexer,
    )
}

pub struct Writer<K> {
    objects: Objects<K>,
    sync: watch::Sender<SyncState>,
}

impl<K> Writer<K> {
    /// Stores the latest snapshot, returning the one it replaced.
    pub fn apply(&mut self, key: ObjectKey, obj: K) -> Result<Option<Arc<K>>, CacheError> {
        let mut objects = self.objects.write().map_err(|_| CacheError::Poisoned)?;
        Ok(objects.insert(key, Arc::new(obj)))
    }

    pub fn delete(&mut self, key: &ObjectKey) -> Result<Option<Arc<K>>, CacheError> {
        let mut objects = self.objects.write().map_err(|_| CacheError::Poisoned)?;
        Ok(objects.remove(key))
    }

    /// Swaps in a complete listing. Returns the keys that disappeared.
    pub fn replace(&mut self, listing: Vec<(ObjectKey, K)>) -> Result<Vec<ObjectKey>, CacheError> {
        let fresh: HashMap<_, _> = listing
            .into_iter()
            .map(|(key, obj)| (key, Arc::new(obj)))
            .collect();
        let mut objects = self.objects.write().map_err(|_| CacheError::Poisoned)?;
        let mut vanished: Vec<_> = objects
            .keys()
            .filter(|key| !fresh.contains_key(*key))
            .cloned()
            .collect();
        vanished.sort();
        *objects = fresh;
        Ok(vanished)
    }

    pub fn mark_synced(&self) {
        self.sync.send_replace(SyncState::Synced);
    }

    /// Reports that the source can never produce an initial listing. Ignored
    /// once the cache has synced.
    pub fn mark_failed(&self, reason: impl Into<String>) -> bool {
        if self.is_synced() {
            return false;
        }
        self.sync.send_replace(SyncState::Failed(reason.into()));
        true
    }

    pub fn is_synced(&self) -> bool {
        *self.sync.borrow() == SyncState::Synced
    }

    pub fn as_reader(&self) -> Indexer<K> {
        Indexer {
            objects: Arc::clone(&self.objects),
            sync: self.sync.subscribe(),
        }
    }

    #[cfg(test)]
    pub(crate) fn poison(&self)
    where
        K: Send + Sync + 'static,
    {
        let objects = Arc::clone(&self.objects);
        let _ = std::thread::spawn(move || {
            let _guard = objects.write();
            panic!("poisoning cache for test");
        })
        .join();
    }
}

pub struct Indexer<K> {
    objects: Objects<K>,
    sync: watch::Receiver<SyncState>,
}

impl<K> Clone for Indexer<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
            sync: self.sync.clone(),
        }
    }
}

impl<K> Indexer<K> {
    pub fn get_by_key(&self, key: &ObjectKey) -> Result<Lookup<K>, CacheError> {
        let objects = self.objects.read().map_err(|_| CacheError::Poisoned)?;
        Ok(objects
            .get(key)
            .map_or(Lookup::Absent, |obj| Lookup::Present(Arc::clone(obj))))
    }

    /// All cached keys, sorted.
    pub fn keys(&self) -> Result<Vec<ObjectKey>, CacheError> {
        let objects = self.objects.read().map_err(|_| CacheError::Poisoned)?;
        let mut keys: Vec<_> = objects.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        Ok(self.objects.read().map_err(|_| CacheError::Poisoned)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    pub fn is_synced(&self) -> bool {
        *self.sync.borrow() == SyncState::Synced
    }

    /// Resolves once the first full listing is in the cache.
    pub async fn wait_for_initial_sync(
        &self,
        stop: &CancellationToken,
    ) -> Result<SyncOutcome, SyncError> {
        let mut sync = self.sync.clone();
        loop {
            let state = sync.borrow_and_update().clone();
            match state {
                SyncState::Synced => return Ok(SyncOutcome::Synced),
                SyncState::Failed(reason) => return Err(SyncError::Failed(reason)),
                SyncState::Pending => {}
            }
            tokio::select! {
                _ = stop.cancelled() => return Ok(SyncOutcome::Stopped),
                changed = sync.changed() => {
                    if changed.is_err() {
                        return Err(SyncError::SourceClosed);
                    }
                }
            }
        }
    }
}
