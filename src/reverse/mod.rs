//! Redirecting workload traffic to the developer's machine.
//!
//! The original workload is taken out of service (scaled to zero, or
//! deleted when it has no scale) and its pre-redirect state is recorded on
//! a shadow pod that takes over its labels. Reset reads that record back.

pub mod shadow;

use crate::cluster::{ClusterApi, ClusterError, ContainerPort, WorkloadKind, WorkloadRef};
use crate::error::{VpnError, VpnResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use shadow::{create_inbound_pod, remove_inbound_pod, shadow_name, ShadowSpec};

/// Shadow pod annotation holding the serialized [`OriginalState`] list.
pub const ORIGIN_DATA_ANNOTATION: &str = "kubetun.io/origin-data";

/// How far to follow owner references before giving up.
const MAX_OWNER_DEPTH: usize = 8;

/// What a redirected workload looked like before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OriginalState {
    /// Scaled to zero from `replicas`.
    Replicas { workload: String, replicas: i32 },
    /// Deleted; recreated from `object`.
    Object { workload: String, object: Value },
}

impl OriginalState {
    pub fn workload(&self) -> VpnResult<WorkloadRef> {
        match self {
            Self::Replicas { workload, .. } | Self::Object { workload, .. } => workload.parse(),
        }
    }
}

/// Result of taking a workload out of service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Captured {
    /// Labels the shadow pod must carry to receive the traffic.
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<ContainerPort>,
    pub original: Vec<OriginalState>,
}

impl Captured {
    pub fn encode(&self) -> VpnResult<String> {
        serde_json::to_string(&self.original)
            .map_err(|e| VpnError::Protocol(format!("encode original state: {}", e)))
    }
}

pub fn decode_original(data: &str) -> VpnResult<Vec<OriginalState>> {
    serde_json::from_str(data)
        .map_err(|e| VpnError::Protocol(format!("decode original state: {}", e)))
}

// ============================================================================
// Object helpers
// ============================================================================

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn container_ports(containers: Option<&Value>) -> Vec<ContainerPort> {
    let mut ports: Vec<ContainerPort> = containers
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|c| c.get("ports"))
        .filter_map(|p| serde_json::from_value::<Vec<ContainerPort>>(p.clone()).ok())
        .flatten()
        .collect();
    ports.dedup_by(|a, b| a.container_port == b.container_port && a.protocol == b.protocol);
    ports
}

/// Pod labels and container ports of a workload object.
pub fn pod_template(kind: &WorkloadKind, object: &Value) -> (BTreeMap<String, String>, Vec<ContainerPort>) {
    if *kind == WorkloadKind::Pod {
        return (
            string_map(object.pointer("/metadata/labels")),
            container_ports(object.pointer("/spec/containers")),
        );
    }
    let mut labels = string_map(object.pointer("/spec/template/metadata/labels"));
    if labels.is_empty() {
        labels = string_map(object.pointer("/spec/selector/matchLabels"));
    }
    (
        labels,
        container_ports(object.pointer("/spec/template/spec/containers")),
    )
}

/// Copy of `object` that can be created again.
pub fn strip_object(object: &Value) -> Value {
    let mut object = object.clone();
    if let Some(root) = object.as_object_mut() {
        root.remove("status");
        if let Some(meta) = root.get_mut("metadata").and_then(Value::as_object_mut) {
            for key in [
                "managedFields",
                "resourceVersion",
                "uid",
                "creationTimestamp",
                "generation",
                "selfLink",
                "deletionTimestamp",
            ] {
                meta.remove(key);
            }
        }
    }
    object
}

fn controller_owner(object: &Value) -> Option<WorkloadRef> {
    object
        .pointer("/metadata/ownerReferences")?
        .as_array()?
        .iter()
        .find(|o| o.get("controller").and_then(Value::as_bool) == Some(true))
        .and_then(|o| {
            let kind = o.get("kind")?.as_str()?;
            let name = o.get("name")?.as_str()?;
            Some(WorkloadRef::new(WorkloadKind::parse(kind), name))
        })
}

// ============================================================================
// Controller
// ============================================================================

/// Takes workloads out of service and puts them back.
pub struct WorkloadController {
    cluster: Arc<dyn ClusterApi>,
}

impl WorkloadController {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Outermost controller of a pod, following controller owner references.
    /// `None` for a bare pod.
    pub async fn top_controller(&self, pod: &str) -> VpnResult<Option<WorkloadRef>> {
        let mut current = WorkloadRef::new(WorkloadKind::Pod, pod);
        let mut top = None;
        for _ in 0..MAX_OWNER_DEPTH {
            let object = self.cluster.get_object(&current).await?;
            match controller_owner(&object) {
                Some(owner) => {
                    top = Some(owner.clone());
                    current = owner;
                }
                None => break,
            }
        }
        Ok(top)
    }

    /// Record `target` and stop it: scale to zero when it scales, delete
    /// it otherwise.
    async fn stop(&self, target: &WorkloadRef, object: &Value) -> VpnResult<OriginalState> {
        if target.kind.is_scalable() {
            let replicas = self.cluster.get_replicas(target).await?;
            self.cluster.set_replicas(target, 0).await?;
            log::info!("scaled {} from {} to 0", target, replicas);
            Ok(OriginalState::Replicas {
                workload: target.to_string(),
                replicas,
            })
        } else {
            let object = strip_object(object);
            self.cluster.delete_object(target).await?;
            log::info!("deleted {}", target);
            Ok(OriginalState::Object {
                workload: target.to_string(),
                object,
            })
        }
    }

    /// Take `workload` out of service and describe the pod that replaces it.
    pub async fn scale_to_zero(&self, workload: &WorkloadRef) -> VpnResult<Captured> {
        match &workload.kind {
            WorkloadKind::Service => self.scale_service(&workload.name).await,
            WorkloadKind::Pod => {
                let target = match self.top_controller(&workload.name).await? {
                    Some(controller) => controller,
                    None => workload.clone(),
                };
                self.scale_one(&target).await
            }
            _ => self.scale_one(workload).await,
        }
    }

    async fn scale_one(&self, target: &WorkloadRef) -> VpnResult<Captured> {
        let object = self.cluster.get_object(target).await?;
        let (labels, ports) = pod_template(&target.kind, &object);
        let original = vec![self.stop(target, &object).await?];
        Ok(Captured {
            labels,
            ports,
            original,
        })
    }

    /// Stop every controller behind the service's pods.
    async fn scale_service(&self, name: &str) -> VpnResult<Captured> {
        let service = self.cluster.get_service(name).await?;
        if service.selector.is_empty() {
            return Err(VpnError::config(format!("service {} has no selector", name)));
        }

        let mut targets: Vec<WorkloadRef> = Vec::new();
        for pod in self.cluster.list_pods(&service.selector).await? {
            let target = match self.top_controller(&pod.name).await? {
                Some(controller) => controller,
                None => WorkloadRef::new(WorkloadKind::Pod, pod.name),
            };
            if !targets.contains(&target) {
                targets.push(target);
            }
        }

        let mut original = Vec::with_capacity(targets.len());
        for target in &targets {
            let object = self.cluster.get_object(target).await?;
            match self.stop(target, &object).await {
                Ok(state) => original.push(state),
                Err(e) => {
                    self.restore(&original).await;
                    return Err(e);
                }
            }
        }

        Ok(Captured {
            labels: service.selector,
            ports: service
                .ports
                .into_iter()
                .map(|p| ContainerPort {
                    container_port: p.container_port(),
                    name: p.name,
                    protocol: p.protocol,
                })
                .collect(),
            original,
        })
    }

    /// Put recorded workloads back. Failures are logged; returns how many
    /// could not be restored.
    pub async fn restore(&self, states: &[OriginalState]) -> usize {
        let mut failed = 0;
        for state in states {
            if let Err(e) = self.restore_one(state).await {
                log::warn!("restore failed: {}", e);
                failed += 1;
            }
        }
        failed
    }

    async fn restore_one(&self, state: &OriginalState) -> VpnResult<()> {
        let workload = state.workload()?;
        match state {
            OriginalState::Replicas { replicas, .. } => {
                self.cluster.set_replicas(&workload, *replicas).await?;
                log::info!("scaled {} back to {}", workload, replicas);
            }
            OriginalState::Object { object, .. } => {
                match self.cluster.create_object(&workload, object).await {
                    Ok(()) => log::info!("recreated {}", workload),
                    Err(ClusterError::AlreadyExists(_)) => {
                        log::debug!("{} already exists", workload)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Restore `workload` from its shadow pod and clear the record. A
    /// missing shadow pod or a cleared record is a no-op.
    pub async fn reset(&self, workload: &WorkloadRef) -> VpnResult<()> {
        let name = shadow_name(workload);
        let pod = match self.cluster.get_pod(&name).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                log::debug!("no shadow pod for {}", workload);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let Some(data) = pod.annotation(ORIGIN_DATA_ANNOTATION).filter(|d| !d.is_empty()) else {
            log::debug!("{} already reset", workload);
            return Ok(());
        };

        let states = decode_original(data)?;
        let failed = self.restore(&states).await;
        if failed > 0 {
            return Err(VpnError::Cluster(ClusterError::Api(format!(
                "{} of {} workload(s) behind {} not restored",
                failed,
                states.len(),
                workload
            ))));
        }

        let clear = BTreeMap::from([(ORIGIN_DATA_ANNOTATION.to_string(), None)]);
        self.cluster
            .patch_pod_annotations(&name, &clear, pod.resource_version.as_deref())
            .await?;
        Ok(())
    }
}
