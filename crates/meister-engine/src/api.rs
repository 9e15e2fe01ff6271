//! Public API types for the meister scheduler engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use meister_core::Store;

use crate::brain::ToadBrain;
use crate::cluster::{ClusterApi, ClusterClient};
use crate::creators::{Creator, poll_sanitizer::PollSanitizerCreator, rex::RexCreator};
use crate::resources::ResourceAccountant;
use crate::scheduler::{Dispatcher, Mode, Scheduler};

/// Where the cluster control plane lives, from the in-cluster
/// environment.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Control-plane host (`KUBERNETES_SERVICE_HOST`).
    pub host: String,
    /// Control-plane port (`KUBERNETES_SERVICE_PORT`).
    pub port: u16,
}

/// Everything worker pods inherit from the scheduler's environment.
#[derive(Debug, Clone)]
pub struct WorkerPodConfig {
    /// Worker container image reference.
    pub image: String,
    /// Image pull policy forwarded verbatim to the pod spec.
    pub image_pull_policy: String,
    /// Database credentials injected into every worker.
    pub database_user: String,
    /// See [`WorkerPodConfig::database_user`].
    pub database_password: String,
    /// Database name injected into every worker.
    pub database_name: String,
    /// Whether workers should read from database replicas.
    pub use_slaves: bool,
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// `None` selects the offline mode: a single pass that persists
    /// brain priorities and performs no cluster mutation.
    pub cluster: Option<ClusterConfig>,
    /// Bound on creator fan-out and pod-classification parallelism.
    pub num_threads: usize,
    /// Factor (>= 1.0) multiplying the available-resource vector.
    pub overprovisioning: f64,
    /// Pause between scheduler ticks.
    pub sleepytime: Duration,
    /// Worker pod settings.
    pub worker_pods: WorkerPodConfig,
}

/// Assemble the default creators and brain and run the scheduler until
/// `shutdown` flips, or until the single offline pass completes.
pub async fn run_scheduler(
    cfg: SchedulerConfig,
    store: Store,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let creators: Vec<Arc<dyn Creator>> = vec![
        Arc::new(RexCreator::new(store.clone())),
        Arc::new(PollSanitizerCreator::new(store.clone())),
    ];

    let mode = match &cfg.cluster {
        None => Mode::Offline,
        Some(cluster_cfg) => {
            let client: Arc<dyn ClusterApi> =
                Arc::new(ClusterClient::from_env(&cluster_cfg.host, cluster_cfg.port)?);
            let accountant =
                ResourceAccountant::new(client.clone(), cfg.overprovisioning, cfg.num_threads);
            Mode::Cluster {
                dispatcher: Dispatcher::new(client, accountant, cfg.worker_pods.clone()),
                sleepytime: cfg.sleepytime,
            }
        }
    };

    let mut scheduler = Scheduler::new(
        store,
        creators,
        Box::new(ToadBrain),
        cfg.num_threads,
        mode,
    );
    scheduler.run(shutdown).await
}
