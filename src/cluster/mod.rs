//! Cluster control API.
//!
//! Everything the orchestrators need from Kubernetes goes through
//! [`ClusterApi`], scoped to one namespace. [`kube::KubeCluster`] talks to a
//! real API server; tests use an in-memory implementation.

pub mod kube;
#[cfg(test)]
pub mod memory;

use crate::error::VpnError;
use crate::proxy::transport::IoStream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub use self::kube::KubeCluster;

/// Cluster API failures.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Optimistic-concurrency precondition failed (stale resourceVersion).
    #[error("conflict updating {0}")]
    Conflict(String),

    #[error("cluster API error: {0}")]
    Api(String),
}

impl ClusterError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMapRecord {
    pub name: String,
    pub data: BTreeMap<String, String>,
    /// Version the record was read at; replace fails if it is stale.
    pub resource_version: Option<String>,
}

impl ConfigMapRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn get(&self, key: &str) -> &str {
        self.data.get(key).map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodRecord {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Pod phase as reported by the API (`Pending`, `Running`, ...).
    pub phase: String,
    pub pod_ip: Option<String>,
    /// Deletion has been requested.
    pub terminating: bool,
    pub resource_version: Option<String>,
}

impl PodRecord {
    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub container_port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// What the tool needs to create a single-container pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodManifest {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub container_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub ports: Vec<ContainerPort>,
    pub privileged: bool,
    pub capabilities: Vec<String>,
    /// Resource requests, e.g. `cpu -> 128m`.
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
    pub priority_class: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePort {
    pub name: Option<String>,
    pub port: i32,
    /// Numeric `targetPort`. Named target ports are left unresolved.
    pub target_port: Option<i32>,
    pub protocol: Option<String>,
}

impl ServicePort {
    /// Port the backing containers listen on.
    pub fn container_port(&self) -> i32 {
        self.target_port.unwrap_or(self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<ServicePort>,
    pub cluster_ip: Option<String>,
}

// ============================================================================
// Workload References
// ============================================================================

/// Kind of a workload the reverse flow can redirect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    ReplicaSet,
    DaemonSet,
    Service,
    Pod,
    /// Any other kind, by its Kubernetes kind name.
    Custom(String),
}

impl WorkloadKind {
    /// Parse a kind as written on the command line (aliases and plurals).
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "deploy" | "deployment" | "deployments" => Self::Deployment,
            "sts" | "statefulset" | "statefulsets" => Self::StatefulSet,
            "rs" | "replicaset" | "replicasets" => Self::ReplicaSet,
            "ds" | "daemonset" | "daemonsets" => Self::DaemonSet,
            "svc" | "service" | "services" => Self::Service,
            "po" | "pod" | "pods" => Self::Pod,
            _ => Self::Custom(s.to_string()),
        }
    }

    /// The Kubernetes `kind` name.
    pub fn kind(&self) -> &str {
        match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::ReplicaSet => "ReplicaSet",
            Self::DaemonSet => "DaemonSet",
            Self::Service => "Service",
            Self::Pod => "Pod",
            Self::Custom(kind) => kind,
        }
    }

    /// Lower-case plural resource name.
    pub fn resource(&self) -> String {
        match self {
            Self::Deployment => "deployments".into(),
            Self::StatefulSet => "statefulsets".into(),
            Self::ReplicaSet => "replicasets".into(),
            Self::DaemonSet => "daemonsets".into(),
            Self::Service => "services".into(),
            Self::Pod => "pods".into(),
            Self::Custom(kind) => {
                let lower = kind.to_ascii_lowercase();
                if lower.ends_with('s') {
                    lower
                } else {
                    format!("{}s", lower)
                }
            }
        }
    }

    /// Kinds redirected by scaling to zero.
    pub fn is_scalable(&self) -> bool {
        matches!(
            self,
            Self::Deployment | Self::StatefulSet | Self::ReplicaSet
        )
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// `kind/name` reference to a workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(kind: WorkloadKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl FromStr for WorkloadRef {
    type Err = VpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| VpnError::config(format!("workload {:?} is not kind/name", s)))?;
        if kind.is_empty() || name.is_empty() || name.contains('/') {
            return Err(VpnError::config(format!(
                "workload {:?} is not kind/name",
                s
            )));
        }
        Ok(Self::new(WorkloadKind::parse(kind), name))
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.resource(), self.name)
    }
}

// ============================================================================
// API
// ============================================================================

/// Namespace-scoped cluster operations.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    fn namespace(&self) -> &str;

    async fn get_config_map(&self, name: &str) -> ClusterResult<ConfigMapRecord>;
    async fn create_config_map(&self, cm: &ConfigMapRecord) -> ClusterResult<ConfigMapRecord>;
    /// Replace conditionally on `cm.resource_version`; a stale version is a
    /// [`ClusterError::Conflict`].
    async fn replace_config_map(&self, cm: &ConfigMapRecord) -> ClusterResult<ConfigMapRecord>;
    async fn delete_config_map(&self, name: &str) -> ClusterResult<()>;

    async fn get_pod(&self, name: &str) -> ClusterResult<PodRecord>;
    /// Pods matching every label in `selector`; an empty selector matches all.
    async fn list_pods(&self, selector: &BTreeMap<String, String>) -> ClusterResult<Vec<PodRecord>>;
    async fn create_pod(&self, manifest: &PodManifest) -> ClusterResult<PodRecord>;
    async fn wait_pod_running(&self, name: &str, timeout: Duration) -> ClusterResult<PodRecord>;
    /// Set (`Some`) or remove (`None`) annotations, conditionally on
    /// `resource_version` when given.
    async fn patch_pod_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
        resource_version: Option<&str>,
    ) -> ClusterResult<PodRecord>;
    async fn delete_pod(&self, name: &str) -> ClusterResult<()>;
    /// Run `command` in the pod's first container and return its stdout.
    async fn exec(&self, pod: &str, command: &[String]) -> ClusterResult<String>;
    /// Open a stream to `port` inside the pod.
    async fn port_forward(&self, pod: &str, port: u16) -> ClusterResult<IoStream>;

    /// `spec.podCIDR` of every node that has one.
    async fn node_pod_cidrs(&self) -> ClusterResult<Vec<String>>;
    /// Cluster IPs of the namespace's services (headless ones excluded).
    async fn service_cluster_ips(&self) -> ClusterResult<Vec<String>>;
    async fn get_service(&self, name: &str) -> ClusterResult<ServiceRecord>;

    /// Full object as JSON.
    async fn get_object(&self, workload: &WorkloadRef) -> ClusterResult<serde_json::Value>;
    async fn create_object(&self, workload: &WorkloadRef, object: &serde_json::Value) -> ClusterResult<()>;
    async fn delete_object(&self, workload: &WorkloadRef) -> ClusterResult<()>;
    async fn get_replicas(&self, workload: &WorkloadRef) -> ClusterResult<i32>;
    async fn set_replicas(&self, workload: &WorkloadRef, replicas: i32) -> ClusterResult<()>;
}
