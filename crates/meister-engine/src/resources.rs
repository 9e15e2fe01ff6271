//! Cluster-wide resource accounting.
//!
//! The accountant tracks aggregate (not per-node) budgets. That is a
//! deliberate accuracy sacrifice: totals may say a job fits while no
//! single node can place it. The short cache TTL plus retry on the next
//! tick bounds how long that mistake lasts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::cluster::{ClusterApi, ClusterError, Pod, PodPhase, parse_cpu, parse_memory, parse_pods};

/// Aggregate cpu / memory / pod-slot budget. Memory is bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ResourceVector {
    pub(crate) cpu: f64,
    pub(crate) memory: i64,
    pub(crate) pods: i64,
}

impl ResourceVector {
    pub(crate) const ZERO: ResourceVector = ResourceVector {
        cpu: 0.0,
        memory: 0,
        pods: 0,
    };

    fn subtract(&mut self, cost: ResourceVector) {
        self.cpu -= cost.cpu;
        self.memory -= cost.memory;
        self.pods -= cost.pods;
    }

    fn clamp_non_negative(&mut self) {
        self.cpu = self.cpu.max(0.0);
        self.memory = self.memory.max(0);
        self.pods = self.pods.max(0);
    }

    fn scale(&mut self, factor: f64) {
        self.cpu *= factor;
        self.memory = (self.memory as f64 * factor) as i64;
        self.pods = (self.pods as f64 * factor) as i64;
    }
}

/// Derives and briefly caches the cluster's available resource budget.
///
/// Node capacities are fetched once per process; the node set is treated
/// as stable. The available vector is recomputed at most once per TTL,
/// so every admission decision within a tick sees the same snapshot.
pub(crate) struct ResourceAccountant {
    cluster: Arc<dyn ClusterApi>,
    overprovisioning: f64,
    num_threads: usize,
    ttl: Duration,
    node_capacity: Option<ResourceVector>,
    cached: Option<(Instant, ResourceVector)>,
}

impl ResourceAccountant {
    const CACHE_TTL: Duration = Duration::from_secs(1);

    pub(crate) fn new(
        cluster: Arc<dyn ClusterApi>,
        overprovisioning: f64,
        num_threads: usize,
    ) -> Self {
        Self {
            cluster,
            overprovisioning,
            num_threads: num_threads.max(1),
            ttl: Self::CACHE_TTL,
            node_capacity: None,
            cached: None,
        }
    }

    /// The current cluster-wide budget, overprovisioning applied.
    pub(crate) async fn available(&mut self) -> Result<ResourceVector, ClusterError> {
        if let Some((stamp, snapshot)) = self.cached {
            if stamp.elapsed() <= self.ttl {
                debug!("returning cached resource snapshot");
                return Ok(snapshot);
            }
        }

        let mut budget = self.total_capacity().await?;
        let pods = self.cluster.list_pods().await?;

        // Classify pods on a bounded task set. Terminal pods are reaped
        // here as a side effect rather than by a separate sweeper.
        let mut queue = pods.into_iter();
        let mut join = JoinSet::new();
        loop {
            while join.len() < self.num_threads {
                let Some(pod) = queue.next() else { break };
                let cluster = Arc::clone(&self.cluster);
                join.spawn(async move { inspect_pod(cluster, pod).await });
            }
            match join.join_next().await {
                Some(Ok(Some(cost))) => budget.subtract(cost),
                Some(Ok(None)) => {}
                Some(Err(err)) => error!("pod inspection task failed: {err}"),
                None => break,
            }
        }

        budget.clamp_non_negative();
        budget.scale(self.overprovisioning);

        debug!(
            cpu = budget.cpu,
            memory_gib = budget.memory / (1 << 30),
            pods = budget.pods,
            "resources available"
        );
        self.cached = Some((Instant::now(), budget));
        Ok(budget)
    }

    async fn total_capacity(&mut self) -> Result<ResourceVector, ClusterError> {
        if let Some(total) = self.node_capacity {
            return Ok(total);
        }
        let mut total = ResourceVector::ZERO;
        for node in self.cluster.list_nodes().await? {
            let capacity = &node.status.capacity;
            total.cpu += parse_cpu(&capacity.cpu)?;
            total.memory += parse_memory(&capacity.memory)?;
            total.pods += parse_pods(&capacity.pods)?;
        }
        debug!(
            cpu = total.cpu,
            memory_gib = total.memory / (1 << 30),
            pods = total.pods,
            "total cluster capacity"
        );
        self.node_capacity = Some(total);
        Ok(total)
    }
}

/// Classify one pod: pending/running pods cost their requests (limits
/// when requests are absent, nothing when neither is set) plus one pod
/// slot; terminal pods are deleted best-effort and cost nothing.
async fn inspect_pod(cluster: Arc<dyn ClusterApi>, pod: Pod) -> Option<ResourceVector> {
    let name = pod.metadata.name.clone();
    match pod.phase() {
        PodPhase::Pending | PodPhase::Running => {
            debug!(pod = %name, "pod is taking up resources");
            Some(pod_cost(&pod))
        }
        PodPhase::Succeeded => {
            debug!(pod = %name, "pod succeeded");
            reap(cluster, &name).await;
            None
        }
        PodPhase::Failed => {
            warn!(pod = %name, "pod failed");
            reap(cluster, &name).await;
            None
        }
        PodPhase::Unknown => {
            warn!(pod = %name, "pod in unknown state");
            None
        }
        PodPhase::Other => {
            debug!(pod = %name, "pod is in a weird state");
            None
        }
    }
}

async fn reap(cluster: Arc<dyn ClusterApi>, name: &str) {
    if let Err(err) = cluster.delete_pod(name).await {
        warn!(pod = %name, "pod delete failed: {err}");
    }
}

fn pod_cost(pod: &Pod) -> ResourceVector {
    // Worker pods carry a single container; anything else on the cluster
    // is accounted by its first container only.
    let quantities = pod
        .spec
        .containers
        .first()
        .and_then(|c| c.resources.requests.as_ref().or(c.resources.limits.as_ref()));

    let mut cost = ResourceVector {
        cpu: 0.0,
        memory: 0,
        pods: 1,
    };
    let Some(quantities) = quantities else {
        return cost;
    };

    if let Some(cpu) = quantities.get("cpu") {
        match parse_cpu(cpu) {
            Ok(parsed) => cost.cpu = parsed,
            Err(err) => error!(pod = %pod.metadata.name, "bad cpu quantity: {err}"),
        }
    }
    if let Some(memory) = quantities.get("memory") {
        match parse_memory(memory) {
            Ok(parsed) => cost.memory = parsed,
            Err(err) => error!(pod = %pod.metadata.name, "bad memory quantity: {err}"),
        }
    }
    cost
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ResourceAccountant, ResourceVector};
    use crate::testutil::{FakeCluster, Op, node, pod};

    const GIB: i64 = 1024 * 1024 * 1024;

    #[tokio::test]
    async fn subtracts_active_pods_and_reaps_terminal_ones() {
        let cluster = Arc::new(FakeCluster::with_nodes(vec![node("4", "8Gi", "10")]));
        cluster.insert_pod(pod("worker-1", "Running", &[("cpu", "1500m"), ("memory", "2Gi")]));
        cluster.insert_pod(pod("worker-2", "Succeeded", &[]));

        let mut accountant = ResourceAccountant::new(cluster.clone(), 1.0, 4);
        let available = accountant.available().await.unwrap();

        assert_eq!(
            available,
            ResourceVector {
                cpu: 2.5,
                memory: 6 * GIB,
                pods: 9,
            }
        );
        assert!(cluster.ops().contains(&Op::Delete("worker-2".to_string())));
        assert!(!cluster.pod_names().contains(&"worker-2".to_string()));
    }

    #[tokio::test]
    async fn falls_back_to_limits_and_ignores_unknown_pods() {
        let cluster = Arc::new(FakeCluster::with_nodes(vec![node("4", "8Gi", "10")]));
        let mut limited = pod("worker-1", "Running", &[]);
        limited.spec.containers[0].resources.limits =
            Some([("cpu".to_string(), "500m".to_string())].into_iter().collect());
        cluster.insert_pod(limited);
        cluster.insert_pod(pod("worker-2", "Unknown", &[("cpu", "3"), ("memory", "4Gi")]));

        let mut accountant = ResourceAccountant::new(cluster.clone(), 1.0, 4);
        let available = accountant.available().await.unwrap();

        // The unknown pod is logged but not subtracted; the limited pod
        // costs its limits since it has no requests.
        assert_eq!(available.cpu, 3.5);
        assert_eq!(available.memory, 8 * GIB);
        assert_eq!(available.pods, 9);
        assert!(cluster.ops().is_empty());
    }

    #[tokio::test]
    async fn applies_overprovisioning_and_clamps_at_zero() {
        let cluster = Arc::new(FakeCluster::with_nodes(vec![node("2", "2Gi", "5")]));
        cluster.insert_pod(pod("big", "Running", &[("cpu", "4"), ("memory", "4Gi")]));

        let mut accountant = ResourceAccountant::new(cluster.clone(), 2.0, 4);
        let available = accountant.available().await.unwrap();

        // Oversubscribed below zero: clamped first, then scaled.
        assert_eq!(available.cpu, 0.0);
        assert_eq!(available.memory, 0);
        assert_eq!(available.pods, 8);
    }

    #[tokio::test]
    async fn caches_within_the_ttl() {
        let cluster = Arc::new(FakeCluster::with_nodes(vec![node("4", "8Gi", "10")]));
        let mut accountant = ResourceAccountant::new(cluster.clone(), 1.0, 4);

        let first = accountant.available().await.unwrap();
        cluster.insert_pod(pod("late", "Running", &[("cpu", "2"), ("memory", "1Gi")]));
        let second = accountant.available().await.unwrap();

        assert_eq!(first, second);
    }
}
