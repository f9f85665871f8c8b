use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kube_workqueue_controller::cli::{Cli, Command, Kind};
use kube_workqueue_controller::config::{ControllerConfig, InformerConfig};
use kube_workqueue_controller::informer::{self, Informer};
use kube_workqueue_controller::reconcile::{self, Data};
use kube_workqueue_controller::types::AIOps;
use kube_workqueue_controller::{cache, Controller, WorkQueue};

const LIST_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let client = client(&cli).await?;

    match cli.command {
        Command::Watch {
            kind,
            fail_names,
            tuning,
        } => {
            let config = tuning.controller_config()?;
            let informer_config = tuning.informer_config()?;
            let data = Data {
                fail_names: fail_names.into_iter().collect(),
            };
            let namespace = cli.namespace.as_deref();
            match kind {
                Kind::Pods => {
                    watch::<Pod>(client, namespace, config, informer_config, data).await?
                }
                Kind::Aiops => {
                    watch::<AIOps>(client, namespace, config, informer_config, data).await?
                }
            }
        }
        Command::Get { kind } => {
            let namespace = cli.namespace.as_deref().unwrap_or("default");
            match kind {
                Kind::Pods => get::<Pod>(client, namespace).await?,
                Kind::Aiops => get::<AIOps>(client, namespace).await?,
            }
        }
    }

    Ok(())
}

async fn client(cli: &Cli) -> Result<Client> {
    let config = if cli.incluster {
        kube::Config::from_cluster_env()?
    } else if let Some(path) = cli.kubeconfig.as_ref() {
        let kubeconfig = Kubeconfig::read_from(path)?;
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
    } else {
        kube::Config::infer().await?
    };
    tracing::debug!(cluster_url = %config.cluster_url, "using cluster");
    Ok(Client::try_from(config)?)
}

async fn watch<K>(
    client: Client,
    namespace: Option<&str>,
    config: ControllerConfig,
    informer_config: InformerConfig,
    data: Data,
) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let api = match namespace {
        Some(namespace) => Api::<K>::namespaced(client, namespace),
        None => Api::<K>::all(client),
    };
    let queue = WorkQueue::with_retry_config(&config.retry)?;
    let (writer, indexer) = cache::store::<K>();
    let (notifications_tx, notifications_rx) = mpsc::channel(informer_config.channel_capacity);

    tokio::spawn(informer::watch_resource(
        api,
        ListParams::default(),
        notifications_tx,
        informer_config,
    ));
    tokio::spawn(Informer::new(writer, queue.clone()).run(notifications_rx));

    let stop = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(stop.clone()));

    tracing::info!(kind = %K::kind(&()), namespace = ?namespace, "starting controller");
    Controller::new(queue, indexer, reconcile::reconcile::<K>, Arc::new(data))
        .run(config.workers, stop)
        .await?;

    Ok(())
}

async fn get<K>(client: Client, namespace: &str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let api = Api::<K>::namespaced(client, namespace);
    let objects = tokio::time::timeout(LIST_TIMEOUT, api.list(&ListParams::default())).await??;
    for obj in objects {
        println!("{}", reconcile::describe_listed(&obj));
    }
    Ok(())
}

async fn shutdown_on_signal(stop: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received interrupt, shutting down"),
        Err(error) => tracing::error!(%error, "unable to listen for interrupt, shutting down"),
    }
    stop.cancel();
}
