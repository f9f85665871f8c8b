use thiserror::Error;

use crate::cache::{CacheError, SyncError};
use crate::config::ConfigError;

/// Errors that stop [`Controller::run`](crate::controller::Controller::run).
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Initial cache sync failed: {0}")]
    InitialSync(#[source] SyncError),
    #[error("Worker task failed: {0}")]
    WorkerFailed(#[source] tokio::task::JoinError),
}

/// Why a single key failed to reconcile. Always retried, never fatal.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Failed to read object from cache: {0}")]
    Lookup(#[source] CacheError),
    #[error("{0}")]
    Reconciler(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Reconciler panicked: {0}")]
    Panicked(String),
}
