//! Typed client for the cluster control-plane REST API.
//!
//! Only the surface the scheduler needs: list/read for nodes, and
//! list/create/delete for pods in the scheduler's own namespace. The
//! rest of the API is deliberately not modeled.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, thiserror::Error)]
pub(crate) enum ClusterError {
    /// HTTP 409 on pod create. Callers treat this as "already scheduled".
    #[error("pod already exists")]
    AlreadyExists,
    #[error("cluster api error: http {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("cluster transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid resource quantity {quantity:?}")]
    Quantity { quantity: String },
    #[error("invalid cluster url: {0}")]
    Url(String),
}

/// The pod/node surface the scheduler consumes. [`ClusterClient`] is the
/// production implementation; tests substitute an in-memory fake.
#[async_trait]
pub(crate) trait ClusterApi: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;
    async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError>;
    async fn create_pod(&self, manifest: &PodManifest) -> Result<(), ClusterError>;
    /// Idempotent: deleting an absent pod is success.
    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError>;
    async fn pod_exists(&self, name: &str) -> Result<bool, ClusterError>;
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ObjectMeta {
    #[serde(default)]
    pub(crate) name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Node {
    #[serde(default)]
    pub(crate) metadata: ObjectMeta,
    pub(crate) status: NodeStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct NodeStatus {
    pub(crate) capacity: NodeCapacity,
}

/// Raw capacity quantities as the control plane reports them.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct NodeCapacity {
    pub(crate) cpu: String,
    pub(crate) memory: String,
    pub(crate) pods: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Pod {
    #[serde(default)]
    pub(crate) metadata: ObjectMeta,
    #[serde(default)]
    pub(crate) status: PodStatus,
    #[serde(default)]
    pub(crate) spec: PodSpecView,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct PodStatus {
    #[serde(default)]
    pub(crate) phase: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct PodSpecView {
    #[serde(default)]
    pub(crate) containers: Vec<ContainerView>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ContainerView {
    #[serde(default)]
    pub(crate) resources: ResourcesView,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ResourcesView {
    #[serde(default)]
    pub(crate) requests: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub(crate) limits: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
    Other,
}

impl Pod {
    pub(crate) fn phase(&self) -> PodPhase {
        match self.status.phase.as_deref() {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            Some("Unknown") => PodPhase::Unknown,
            _ => PodPhase::Other,
        }
    }
}

/// Manifest for a worker pod create.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PodManifest {
    pub(crate) api_version: &'static str,
    pub(crate) kind: &'static str,
    pub(crate) metadata: ManifestMeta,
    pub(crate) spec: ManifestSpec,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ManifestMeta {
    pub(crate) name: String,
    pub(crate) labels: BTreeMap<&'static str, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ManifestSpec {
    pub(crate) restart_policy: &'static str,
    pub(crate) containers: Vec<ManifestContainer>,
    pub(crate) volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ManifestContainer {
    pub(crate) name: String,
    pub(crate) image: String,
    pub(crate) image_pull_policy: String,
    pub(crate) resources: ManifestResources,
    pub(crate) env: Vec<EnvVar>,
    pub(crate) volume_mounts: Vec<VolumeMount>,
    pub(crate) security_context: SecurityContext,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ManifestResources {
    pub(crate) requests: QuantityMap,
    pub(crate) limits: QuantityMap,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct QuantityMap {
    pub(crate) cpu: String,
    pub(crate) memory: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct EnvVar {
    pub(crate) name: &'static str,
    pub(crate) value: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VolumeMount {
    pub(crate) name: &'static str,
    pub(crate) mount_path: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct SecurityContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) privileged: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Volume {
    pub(crate) name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) empty_dir: Option<EmptyDir>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) host_path: Option<HostPath>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct EmptyDir {
    pub(crate) medium: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct HostPath {
    pub(crate) path: &'static str,
}

/// Parse a CPU quantity: a bare core count, or millicores with an `m`
/// suffix.
pub(crate) fn parse_cpu(quantity: &str) -> Result<f64, ClusterError> {
    let q = quantity.trim();
    let parsed = if let Some(milli) = q.strip_suffix('m') {
        milli.parse::<f64>().ok().map(|m| m / 1000.0)
    } else {
        q.parse::<f64>().ok()
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| ClusterError::Quantity {
            quantity: quantity.to_string(),
        })
}

/// Parse a memory quantity: bare bytes, or `Ki` / `Mi` / `Gi` binary
/// multiples.
pub(crate) fn parse_memory(quantity: &str) -> Result<i64, ClusterError> {
    let q = quantity.trim();
    let (digits, multiplier) = if let Some(raw) = q.strip_suffix("Ki") {
        (raw, 1024)
    } else if let Some(raw) = q.strip_suffix("Mi") {
        (raw, 1024 * 1024)
    } else if let Some(raw) = q.strip_suffix("Gi") {
        (raw, 1024 * 1024 * 1024)
    } else {
        (q, 1)
    };
    digits
        .parse::<i64>()
        .ok()
        .and_then(|v| v.checked_mul(multiplier))
        .ok_or_else(|| ClusterError::Quantity {
            quantity: quantity.to_string(),
        })
}

pub(crate) fn parse_pods(quantity: &str) -> Result<i64, ClusterError> {
    quantity
        .trim()
        .parse()
        .map_err(|_| ClusterError::Quantity {
            quantity: quantity.to_string(),
        })
}

pub(crate) fn render_cpu(cores: f64) -> String {
    format!("{cores}")
}

pub(crate) fn render_memory(mib: i64) -> String {
    format!("{mib}Mi")
}

/// In-cluster control-plane client.
pub(crate) struct ClusterClient {
    http: reqwest::Client,
    base: Url,
    namespace: String,
    token: Option<String>,
}

impl ClusterClient {
    /// Configure from the in-cluster environment: bearer token, CA
    /// bundle and namespace come from the mounted service account when
    /// present. Outside a pod there is no CA bundle, so certificate
    /// validation is relaxed for local apiservers.
    pub(crate) fn from_env(host: &str, port: u16) -> anyhow::Result<Self> {
        let base = Url::parse(&format!("https://{host}:{port}/"))?;
        let sa = Path::new(SERVICE_ACCOUNT_DIR);

        let token = std::fs::read_to_string(sa.join("token"))
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let namespace = std::fs::read_to_string(sa.join("namespace"))
            .ok()
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| "default".to_string());

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        builder = match std::fs::read(sa.join("ca.crt")) {
            Ok(pem) => builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?),
            Err(_) => builder.danger_accept_invalid_certs(true),
        };

        Ok(Self {
            http: builder.build()?,
            base,
            namespace,
            token,
        })
    }

    fn url(&self, path: &str) -> Result<Url, ClusterError> {
        self.base
            .join(path)
            .map_err(|err| ClusterError::Url(err.to_string()))
    }

    fn pods_path(&self) -> String {
        format!("api/v1/namespaces/{}/pods", self.namespace)
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        self.authed(self.http.get(url))
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

async fn api_error(res: reqwest::Response) -> ClusterError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    ClusterError::Api { status, body }
}

#[async_trait]
impl ClusterApi for ClusterClient {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        let res = self.get(self.url("api/v1/nodes")?).send().await?;
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        let list: ObjectList<Node> = res.json().await?;
        Ok(list.items)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, ClusterError> {
        let res = self.get(self.url(&self.pods_path())?).send().await?;
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        let list: ObjectList<Pod> = res.json().await?;
        Ok(list.items)
    }

    async fn create_pod(&self, manifest: &PodManifest) -> Result<(), ClusterError> {
        let req = self.http.post(self.url(&self.pods_path())?).json(manifest);
        let res = self.authed(req).send().await?;
        if res.status() == StatusCode::CONFLICT {
            return Err(ClusterError::AlreadyExists);
        }
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        let url = self.url(&format!("{}/{name}", self.pods_path()))?;
        let res = self.authed(self.http.delete(url)).send().await?;
        if res.status() == StatusCode::NOT_FOUND || res.status().is_success() {
            return Ok(());
        }
        Err(api_error(res).await)
    }

    async fn pod_exists(&self, name: &str) -> Result<bool, ClusterError> {
        let url = self.url(&format!("{}/{name}", self.pods_path()))?;
        let res = self.get(url).send().await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_cpu, parse_memory, parse_pods};

    #[test]
    fn cpu_quantities_parse_with_milli_suffix() {
        assert_eq!(parse_cpu("1500m").unwrap(), 1.5);
        assert_eq!(parse_cpu("250m").unwrap(), 0.25);
        assert_eq!(parse_cpu("4").unwrap(), 4.0);
        assert_eq!(parse_cpu("0.5").unwrap(), 0.5);
        assert!(parse_cpu("lots").is_err());
        assert!(parse_cpu("").is_err());
    }

    #[test]
    fn memory_quantities_parse_with_binary_suffixes() {
        assert_eq!(parse_memory("512Ki").unwrap(), 512 * 1024);
        assert_eq!(parse_memory("2Mi").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_memory("8Gi").unwrap(), 8 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1048576").unwrap(), 1_048_576);
        assert!(parse_memory("2Ti").is_err());
        assert!(parse_memory("Mi").is_err());
    }

    #[test]
    fn pod_counts_parse_as_integers() {
        assert_eq!(parse_pods("110").unwrap(), 110);
        assert!(parse_pods("many").is_err());
    }
}
