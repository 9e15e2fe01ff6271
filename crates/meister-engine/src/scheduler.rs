//! The scheduler control loop: fan creators out, order the result
//! through the brain, admit against the resource budget, dispatch pods.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use meister_core::{Job, Store};

use crate::api::WorkerPodConfig;
use crate::brain::{Brain, Candidate};
use crate::cluster::{
    ClusterApi, ClusterError, EmptyDir, EnvVar, HostPath, ManifestContainer, ManifestMeta,
    ManifestResources, ManifestSpec, PodManifest, QuantityMap, SecurityContext, Volume,
    VolumeMount, render_cpu, render_memory,
};
use crate::creators::Creator;
use crate::resources::{ResourceAccountant, ResourceVector};

pub(crate) fn worker_name(job_id: i64) -> String {
    format!("worker-{job_id}")
}

/// Resource hints resolved against the job-schema defaults. Memory is
/// MiB, as on the job row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PodResources {
    pub(crate) request_cpu: f64,
    pub(crate) request_memory: i64,
    pub(crate) limit_cpu: f64,
    pub(crate) limit_memory: i64,
}

/// Apply the defaulting rules: unset hints fall back to the schema
/// defaults, and a limit that does not exceed its request is padded to
/// twice the request so the container keeps some headroom.
pub(crate) fn resolve_resources(job: &Job) -> PodResources {
    let request_cpu = job.request_cpu.unwrap_or(Job::DEFAULT_REQUEST_CPU);
    let request_memory = job.request_memory.unwrap_or(Job::DEFAULT_REQUEST_MEMORY);

    let limit_cpu = match job.limit_cpu {
        Some(limit) if request_cpu < limit => limit,
        Some(_) => request_cpu * 2.0,
        None if request_cpu < Job::DEFAULT_LIMIT_CPU => Job::DEFAULT_LIMIT_CPU,
        None => request_cpu * 2.0,
    };
    let limit_memory = match job.limit_memory {
        Some(limit) if request_memory < limit => limit,
        Some(_) => request_memory * 2,
        None if request_memory < Job::DEFAULT_LIMIT_MEMORY => Job::DEFAULT_LIMIT_MEMORY,
        None => request_memory * 2,
    };

    PodResources {
        request_cpu,
        request_memory,
        limit_cpu,
        limit_memory,
    }
}

/// Build the manifest for a job's worker pod. Workers are untrusted
/// binaries: they only get the mounts and privileges their job row
/// explicitly asks for, plus scratch RAM at /dev/shm.
pub(crate) fn build_pod_manifest(job: &Job, cfg: &WorkerPodConfig) -> PodManifest {
    let name = worker_name(job.id);
    let resources = resolve_resources(job);

    let mut volumes = vec![Volume {
        name: "devshm",
        empty_dir: Some(EmptyDir { medium: "Memory" }),
        host_path: None,
    }];
    let mut volume_mounts = vec![VolumeMount {
        name: "devshm",
        mount_path: "/dev/shm",
    }];
    let mut security_context = SecurityContext::default();

    if job.kvm_access {
        volumes.push(Volume {
            name: "devkvm",
            empty_dir: None,
            host_path: Some(HostPath { path: "/dev/kvm" }),
        });
        volume_mounts.push(VolumeMount {
            name: "devkvm",
            mount_path: "/dev/kvm",
        });
        security_context.privileged = Some(true);
    }

    if job.data_access {
        volumes.push(Volume {
            name: "data",
            empty_dir: None,
            host_path: Some(HostPath { path: "/data" }),
        });
        volume_mounts.push(VolumeMount {
            name: "data",
            mount_path: "/data",
        });
    }

    let mut env = vec![
        EnvVar {
            name: "JOB_ID",
            value: job.id.to_string(),
        },
        EnvVar {
            name: "POSTGRES_DATABASE_USER",
            value: cfg.database_user.clone(),
        },
        EnvVar {
            name: "POSTGRES_DATABASE_PASSWORD",
            value: cfg.database_password.clone(),
        },
        EnvVar {
            name: "POSTGRES_DATABASE_NAME",
            value: cfg.database_name.clone(),
        },
        EnvVar {
            name: "POSTGRES_MASTER_CONNECTIONS",
            value: "1".to_string(),
        },
        EnvVar {
            name: "POSTGRES_SLAVE_CONNECTIONS",
            value: "1".to_string(),
        },
    ];
    if cfg.use_slaves {
        env.push(EnvVar {
            name: "POSTGRES_USE_SLAVES",
            value: "true".to_string(),
        });
    }

    let labels: BTreeMap<&'static str, String> = [
        ("app", "worker".to_string()),
        ("worker", job.worker.clone()),
        ("job_id", job.id.to_string()),
    ]
    .into_iter()
    .collect();

    PodManifest {
        api_version: "v1",
        kind: "Pod",
        metadata: ManifestMeta {
            name: name.clone(),
            labels,
        },
        spec: ManifestSpec {
            restart_policy: if job.restart { "OnFailure" } else { "Never" },
            containers: vec![ManifestContainer {
                name,
                image: cfg.image.clone(),
                image_pull_policy: cfg.image_pull_policy.clone(),
                resources: ManifestResources {
                    requests: QuantityMap {
                        cpu: render_cpu(resources.request_cpu),
                        memory: render_memory(resources.request_memory),
                    },
                    limits: QuantityMap {
                        cpu: render_cpu(resources.limit_cpu),
                        memory: render_memory(resources.limit_memory),
                    },
                },
                env,
                volume_mounts,
                security_context,
            }],
            volumes,
        },
    }
}

fn fits(job: &Job, available: ResourceVector) -> bool {
    let resources = resolve_resources(job);
    resources.request_cpu <= available.cpu
        && resources.request_memory * 1024 * 1024 <= available.memory
        && available.pods >= 1
}

/// Admits candidates against the resource budget and drives the cluster.
pub(crate) struct Dispatcher {
    cluster: Arc<dyn ClusterApi>,
    accountant: ResourceAccountant,
    pod_cfg: WorkerPodConfig,
}

impl Dispatcher {
    pub(crate) fn new(
        cluster: Arc<dyn ClusterApi>,
        accountant: ResourceAccountant,
        pod_cfg: WorkerPodConfig,
    ) -> Self {
        Self {
            cluster,
            accountant,
            pod_cfg,
        }
    }

    /// Dispatch candidates in brain order. Jobs that do not fit the
    /// current budget stay pending and are retried on a later tick; a
    /// failing resource snapshot abandons the rest of the tick.
    pub(crate) async fn dispatch(&mut self, candidates: Vec<Candidate>) {
        for (job, priority) in candidates {
            let available = match self.accountant.available().await {
                Ok(available) => available,
                Err(err) => {
                    error!("resource snapshot failed: {err}");
                    return;
                }
            };
            if !fits(&job, available) {
                debug!(job_id = job.id, priority, "budget exhausted, deferring job");
                continue;
            }
            self.schedule(&job).await;
        }
    }

    /// Delete-then-create keeps rescheduling idempotent: afterwards
    /// exactly one `worker-<id>` pod exists for the job.
    pub(crate) async fn schedule(&mut self, job: &Job) {
        debug!(job_id = job.id, "scheduling job");
        self.terminate(&worker_name(job.id)).await;

        let manifest = build_pod_manifest(job, &self.pod_cfg);
        match self.cluster.create_pod(&manifest).await {
            Ok(()) => {}
            Err(ClusterError::AlreadyExists) => warn!(job_id = job.id, "job already scheduled"),
            Err(err) => error!(job_id = job.id, "pod create failed: {err}"),
        }
    }

    /// Terminate the worker pod `name`, if it exists.
    pub(crate) async fn terminate(&mut self, name: &str) {
        match self.cluster.pod_exists(name).await {
            Ok(true) => {
                debug!(pod = %name, "terminating pod");
                if let Err(err) = self.cluster.delete_pod(name).await {
                    warn!(pod = %name, "pod delete failed: {err}");
                }
            }
            Ok(false) => {}
            Err(err) => warn!(pod = %name, "pod lookup failed: {err}"),
        }
    }
}

pub(crate) enum Mode {
    /// No cluster configured: one pass that persists brain priorities
    /// back to the store, for dry runs and offline replay.
    Offline,
    /// Normal operation against the cluster.
    Cluster {
        dispatcher: Dispatcher,
        sleepytime: Duration,
    },
}

pub(crate) struct Scheduler {
    store: Store,
    creators: Vec<Arc<dyn Creator>>,
    brain: Box<dyn Brain>,
    num_threads: usize,
    mode: Mode,
}

impl Scheduler {
    pub(crate) fn new(
        store: Store,
        creators: Vec<Arc<dyn Creator>>,
        brain: Box<dyn Brain>,
        num_threads: usize,
        mode: Mode,
    ) -> Self {
        Self {
            store,
            creators,
            brain,
            num_threads,
            mode,
        }
    }

    pub(crate) async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            let jobs = collect_jobs(&self.creators, self.num_threads).await;
            let candidates = self.brain.sort(jobs);

            match &mut self.mode {
                Mode::Offline => {
                    info!(count = candidates.len(), "cluster absent, persisting priorities");
                    self.store.save_priorities(&candidates).await?;
                    return Ok(());
                }
                Mode::Cluster {
                    dispatcher,
                    sleepytime,
                } => {
                    dispatcher.dispatch(candidates).await;
                    let sleepytime = *sleepytime;
                    debug!("sleepytime...");
                    tokio::select! {
                        _ = tokio::time::sleep(sleepytime) => {}
                        _ = shutdown.changed() => {}
                    }
                    if *shutdown.borrow() {
                        info!("shutdown requested, leaving the scheduler loop");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Fan the creators out on a bounded task set and concatenate their
/// output. A failing creator logs once and contributes nothing; the
/// others are unaffected.
pub(crate) async fn collect_jobs(creators: &[Arc<dyn Creator>], num_threads: usize) -> Vec<Job> {
    let mut queue = creators.iter().cloned();
    let mut join = JoinSet::new();
    let mut jobs = Vec::new();
    loop {
        while join.len() < num_threads.max(1) {
            let Some(creator) = queue.next() else { break };
            join.spawn(async move {
                let name = creator.name();
                match creator.jobs().await {
                    Ok(jobs) => {
                        debug!(creator = name, count = jobs.len(), "creator yielded jobs");
                        jobs
                    }
                    Err(err) => {
                        error!(creator = name, "creator failed: {err:#}");
                        Vec::new()
                    }
                }
            });
        }
        match join.join_next().await {
            Some(Ok(batch)) => jobs.extend(batch),
            Some(Err(err)) => error!("creator task failed: {err}"),
            None => break,
        }
    }
    jobs
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use meister_core::Job;

    use super::{Dispatcher, build_pod_manifest, collect_jobs, resolve_resources, worker_name};
    use crate::creators::Creator;
    use crate::resources::ResourceAccountant;
    use crate::testutil::{FakeCluster, Op, job_with_priority, node, worker_pod_config};

    fn dispatcher(cluster: Arc<FakeCluster>) -> Dispatcher {
        let accountant = ResourceAccountant::new(cluster.clone(), 1.0, 4);
        Dispatcher::new(cluster, accountant, worker_pod_config())
    }

    #[test]
    fn unset_limits_fall_back_to_schema_defaults() {
        let mut job = job_with_priority(1, 0);
        job.request_cpu = Some(0.5);
        job.request_memory = Some(512);
        job.limit_memory = Some(256);

        let resources = resolve_resources(&job);
        assert_eq!(resources.limit_cpu, Job::DEFAULT_LIMIT_CPU);
        // The supplied limit is below the request, so it is padded to
        // twice the request.
        assert_eq!(resources.limit_memory, 1024);
    }

    #[test]
    fn limits_never_undercut_requests() {
        for (request_cpu, limit_cpu) in [(Some(4.0), None), (Some(3.0), Some(1.0)), (None, None)] {
            let mut job = job_with_priority(1, 0);
            job.request_cpu = request_cpu;
            job.limit_cpu = limit_cpu;
            let resources = resolve_resources(&job);
            assert!(
                resources.limit_cpu >= resources.request_cpu,
                "{request_cpu:?} {limit_cpu:?}"
            );
        }
        for (request_memory, limit_memory) in [(Some(8192), None), (Some(512), Some(512)), (None, Some(128))] {
            let mut job = job_with_priority(1, 0);
            job.request_memory = request_memory;
            job.limit_memory = limit_memory;
            let resources = resolve_resources(&job);
            assert!(
                resources.limit_memory >= resources.request_memory,
                "{request_memory:?} {limit_memory:?}"
            );
        }
    }

    #[test]
    fn kvm_access_controls_privilege_and_device_mounts() {
        let mut job = job_with_priority(9, 0);
        job.kvm_access = true;
        let manifest = build_pod_manifest(&job, &worker_pod_config());
        let container = &manifest.spec.containers[0];
        assert_eq!(container.security_context.privileged, Some(true));
        assert!(container.volume_mounts.iter().any(|m| m.mount_path == "/dev/kvm"));

        let plain = build_pod_manifest(&job_with_priority(9, 0), &worker_pod_config());
        let container = &plain.spec.containers[0];
        assert_eq!(container.security_context.privileged, None);
        assert!(!container.volume_mounts.iter().any(|m| m.mount_path == "/dev/kvm"));
    }

    #[test]
    fn manifest_carries_labels_env_and_shm() {
        let job = job_with_priority(42, 0);
        let manifest = build_pod_manifest(&job, &worker_pod_config());

        assert_eq!(manifest.metadata.name, "worker-42");
        assert_eq!(manifest.metadata.labels.get("app").map(String::as_str), Some("worker"));
        assert_eq!(manifest.metadata.labels.get("job_id").map(String::as_str), Some("42"));

        let container = &manifest.spec.containers[0];
        assert!(container.env.iter().any(|e| e.name == "JOB_ID" && e.value == "42"));
        assert!(container.env.iter().any(|e| e.name == "POSTGRES_DATABASE_USER"));
        assert!(container.volume_mounts.iter().any(|m| m.mount_path == "/dev/shm"));
        assert_eq!(manifest.spec.restart_policy, "Never");

        let mut restarting = job_with_priority(42, 0);
        restarting.restart = true;
        let manifest = build_pod_manifest(&restarting, &worker_pod_config());
        assert_eq!(manifest.spec.restart_policy, "OnFailure");
    }

    #[tokio::test]
    async fn rescheduling_is_idempotent_at_the_cluster() {
        let cluster = Arc::new(FakeCluster::with_nodes(vec![node("8", "16Gi", "20")]));
        let mut dispatcher = dispatcher(cluster.clone());
        let job = job_with_priority(7, 100);

        dispatcher.schedule(&job).await;
        dispatcher.schedule(&job).await;

        let name = worker_name(7);
        assert_eq!(cluster.pod_names(), vec![name.clone()]);
        // The second schedule deletes the existing pod before creating.
        assert_eq!(
            cluster.ops(),
            vec![
                Op::Create(name.clone()),
                Op::Delete(name.clone()),
                Op::Create(name),
            ]
        );
    }

    #[tokio::test]
    async fn oversized_jobs_are_deferred() {
        let cluster = Arc::new(FakeCluster::with_nodes(vec![node("1", "1Gi", "5")]));
        let mut dispatcher = dispatcher(cluster.clone());

        let mut big = job_with_priority(1, 100);
        big.request_cpu = Some(8.0);
        let small = job_with_priority(2, 50);

        dispatcher.dispatch(vec![(big, 100.0), (small, 50.0)]).await;

        assert_eq!(cluster.pod_names(), vec![worker_name(2)]);
    }

    struct FailingCreator;

    #[async_trait]
    impl Creator for FailingCreator {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn jobs(&self) -> anyhow::Result<Vec<Job>> {
            anyhow::bail!("state store is unreachable")
        }
    }

    struct FixedCreator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Creator for FixedCreator {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn jobs(&self) -> anyhow::Result<Vec<Job>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![job_with_priority(1, 10), job_with_priority(2, 20)])
        }
    }

    #[tokio::test]
    async fn a_failing_creator_does_not_poison_the_tick() {
        let fixed = Arc::new(FixedCreator {
            calls: AtomicUsize::new(0),
        });
        let creators: Vec<Arc<dyn Creator>> = vec![Arc::new(FailingCreator), fixed.clone()];

        let jobs = collect_jobs(&creators, 8).await;

        let mut ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 1);
    }
}
