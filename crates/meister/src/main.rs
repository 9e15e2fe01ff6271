mod cli;
mod shutdown;

use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meister_core::{DbConfig, Store};
use meister_engine::{ClusterConfig, SchedulerConfig, WorkerPodConfig, run_scheduler};

use crate::cli::Cli;
use crate::shutdown::spawn_signal_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let store = Store::connect(&DbConfig {
        host: cli.postgres_host.clone(),
        port: cli.postgres_port,
        user: cli.postgres_user.clone(),
        password: cli.postgres_password.clone(),
        database: cli.postgres_database.clone(),
    })
    .await?;

    let cluster = cli.cluster_host().map(|host| ClusterConfig {
        host,
        port: cli.kubernetes_port,
    });
    match &cluster {
        Some(cluster) => info!(host = %cluster.host, "scheduling against the cluster"),
        None => info!("no cluster configured, running the offline priority backfill"),
    }

    let cfg = SchedulerConfig {
        cluster,
        num_threads: cli.num_threads,
        overprovisioning: cli.overprovisioning,
        sleepytime: Duration::from_secs(cli.sleepytime),
        worker_pods: WorkerPodConfig {
            image: cli.worker_image.clone(),
            image_pull_policy: cli.worker_image_pull_policy.clone(),
            database_user: cli.postgres_user.clone(),
            database_password: cli.postgres_password.clone(),
            database_name: cli.postgres_database.clone(),
            use_slaves: cli.postgres_use_slaves.is_some(),
        },
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    run_scheduler(cfg, store, shutdown_rx).await
}
