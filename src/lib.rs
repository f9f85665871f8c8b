//! Level-triggered reconciliation over a rate-limited work queue.
//!
//! An [`Informer`] keeps a local cache in step with a watch stream and queues
//! the key of every object that changes. A [`Controller`] drains the
//! [`WorkQueue`] with a pool of workers, reconciling each key against the
//! latest cached state and retrying failures with backoff.

pub mod cache;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod informer;
pub mod key;
pub mod queue;
pub mod rate_limiter;
pub mod reconcile;
pub mod types;

pub use cache::{Indexer, Lookup, Writer};
pub use controller::Controller;
pub use error::{Error, ReconcileError};
pub use informer::{Informer, Notification};
pub use key::ObjectKey;
pub use queue::WorkQueue;
pub use rate_limiter::RateLimiter;
