//! In-memory stand-ins shared by the unit tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use meister_core::{Job, JobKind};

use crate::api::WorkerPodConfig;
use crate::cluster::{
    ClusterApi, ClusterError, ContainerView, Node, NodeCapacity, NodeStatus, ObjectMeta, Pod,
    PodManifest, PodSpecView, PodStatus, ResourcesView,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    Create(String),
    Delete(String),
}

/// A fake cluster that records every mutation.
#[derive(Default)]
pub(crate) struct FakeCluster {
    nodes: Vec<Node>,
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    pods: BTreeMap<String, Pod>,
    ops: Vec<Op>,
}

impl FakeCluster {
    pub(crate) fn with_nodes(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub(crate) fn insert_pod(&self, pod: Pod) {
        let mut state = self.state.lock().unwrap();
        state.pods.insert(pod.metadata.name.clone(), pod);
    }

    pub(crate) fn pod_names(&self) -> Vec<String> {
        self.state.lock().unwrap().pods.keys().cloned().collect()
    }

    pub(crate) fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        Ok(self.nodes.clone())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError> {
        Ok(self.state.lock().unwrap().pods.values().cloned().collect())
    }

    async fn create_pod(&self, manifest: &PodManifest) -> Result<(), ClusterError> {
        let name = manifest.metadata.name.clone();
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::Create(name.clone()));
        if state.pods.contains_key(&name) {
            return Err(ClusterError::AlreadyExists);
        }
        state.pods.insert(name.clone(), pod(&name, "Running", &[]));
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::Delete(name.to_string()));
        state.pods.remove(name);
        Ok(())
    }

    async fn pod_exists(&self, name: &str) -> Result<bool, ClusterError> {
        Ok(self.state.lock().unwrap().pods.contains_key(name))
    }
}

pub(crate) fn node(cpu: &str, memory: &str, pods: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: "node".to_string(),
        },
        status: NodeStatus {
            capacity: NodeCapacity {
                cpu: cpu.to_string(),
                memory: memory.to_string(),
                pods: pods.to_string(),
            },
        },
    }
}

pub(crate) fn pod(name: &str, phase: &str, requests: &[(&str, &str)]) -> Pod {
    let requests = if requests.is_empty() {
        None
    } else {
        Some(
            requests
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    };
    Pod {
        metadata: ObjectMeta {
            name: name.to_string(),
        },
        status: PodStatus {
            phase: Some(phase.to_string()),
        },
        spec: PodSpecView {
            containers: vec![ContainerView {
                resources: ResourcesView {
                    requests,
                    limits: None,
                },
            }],
        },
    }
}

pub(crate) fn job_with_priority(id: i64, priority: i64) -> Job {
    Job {
        id,
        kind: JobKind::Rex,
        worker: "rex".to_string(),
        payload: json!({}),
        priority,
        request_cpu: None,
        request_memory: None,
        limit_cpu: None,
        limit_memory: None,
        kvm_access: false,
        data_access: false,
        restart: false,
        created_at: Utc::now(),
    }
}

pub(crate) fn worker_pod_config() -> WorkerPodConfig {
    WorkerPodConfig {
        image: "registry.invalid/worker:latest".to_string(),
        image_pull_policy: "IfNotPresent".to_string(),
        database_user: "worker".to_string(),
        database_password: "hunter2".to_string(),
        database_name: "crs".to_string(),
        use_slaves: false,
    }
}
