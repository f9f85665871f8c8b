use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{
    ConfigError, ControllerConfig, InformerConfig, RetryConfig, DEFAULT_BASE_DELAY,
    DEFAULT_BURST, DEFAULT_INITIAL_LIST_ATTEMPTS, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES,
    DEFAULT_QPS, DEFAULT_WATCH_RETRY_DELAY, DEFAULT_WORKERS,
};

/// Watches cluster objects and reconciles every change through a
/// rate-limited work queue.
#[derive(Debug, Parser)]
#[command(name = "controller", version)]
pub struct Cli {
    /// Use the service account of the pod this runs in.
    #[arg(long, global = true)]
    pub incluster: bool,

    /// Path to a kubeconfig file; defaults to the usual lookup.
    #[arg(long, global = true, conflicts_with = "incluster")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace to watch or list. Watches cover all namespaces when unset,
    /// listing falls back to "default".
    #[arg(long, short, global = true)]
    pub namespace: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cache and reconcile objects of a kind until interrupted.
    Watch {
        #[arg(value_enum, default_value_t = Kind::Pods)]
        kind: Kind,

        /// Make reconciles of this object name fail. Repeatable.
        #[arg(long = "fail-name")]
        fail_names: Vec<String>,

        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Print the objects of a kind once.
    Get {
        #[arg(value_enum)]
        kind: Kind,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Kind {
    Pods,
    Aiops,
}

#[derive(Debug, Args)]
pub struct TuningArgs {
    /// Concurrent reconcile workers.
    #[arg(long, env = "WORKQUEUE_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Failures tolerated per object before it is dropped.
    #[arg(long, env = "WORKQUEUE_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// First retry delay in milliseconds, doubled per failure.
    #[arg(
        long,
        env = "WORKQUEUE_BASE_DELAY_MS",
        default_value_t = DEFAULT_BASE_DELAY.as_millis() as u64
    )]
    pub base_delay_ms: u64,

    /// Retry delay cap in seconds.
    #[arg(
        long,
        env = "WORKQUEUE_MAX_DELAY_SECS",
        default_value_t = DEFAULT_MAX_DELAY.as_secs()
    )]
    pub max_delay_secs: u64,

    /// Sustained requeues per second across all objects.
    #[arg(long, env = "WORKQUEUE_QPS", default_value_t = DEFAULT_QPS)]
    pub qps: f64,

    /// Requeues allowed in a burst.
    #[arg(long, env = "WORKQUEUE_BURST", default_value_t = DEFAULT_BURST)]
    pub burst: u32,

    /// Failed list attempts tolerated before giving up on the initial sync.
    #[arg(
        long,
        env = "WORKQUEUE_INITIAL_LIST_ATTEMPTS",
        default_value_t = DEFAULT_INITIAL_LIST_ATTEMPTS
    )]
    pub initial_list_attempts: u32,

    /// Pause in milliseconds before resuming a failed watch.
    #[arg(
        long,
        env = "WORKQUEUE_WATCH_RETRY_DELAY_MS",
        default_value_t = DEFAULT_WATCH_RETRY_DELAY.as_millis() as u64
    )]
    pub watch_retry_delay_ms: u64,
}

impl TuningArgs {
    pub fn controller_config(&self) -> Result<ControllerConfig, ConfigError> {
        let config = ControllerConfig {
            workers: self.workers,
            retry: RetryConfig {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_secs(self.max_delay_secs),
                qps: self.qps,
                burst: self.burst,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn informer_config(&self) -> Result<InformerConfig, ConfigError> {
        let config = InformerConfig {
            initial_list_attempts: self.initial_list_attempts,
            watch_retry_delay: Duration::from_millis(self.watch_retry_delay_ms),
            ..InformerConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}
