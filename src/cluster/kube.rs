//! [`ClusterApi`] backed by a live API server through `kube`.

use super::{
    ClusterApi, ClusterError, ClusterResult, ConfigMapRecord, PodManifest, PodRecord, ServicePort,
    ServiceRecord, WorkloadKind, WorkloadRef,
};
use crate::proxy::transport::IoStream;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, Container, ContainerPort, Node, Pod, PodSpec, ResourceRequirements,
    SecurityContext, Service,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{
    Api, ApiResource, AttachParams, DeleteParams, DynamicObject, ListParams, Patch, PatchParams,
    PostParams, PropagationPolicy,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::Discovery;
use kube::{Client, Config};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// How often pod status is polled while waiting for `Running`.
const POD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Kubernetes client scoped to one namespace.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    /// Connect using `kubeconfig` or the inferred environment (in-cluster or
    /// `$KUBECONFIG`). `namespace` defaults to the kubeconfig context's.
    pub async fn connect(kubeconfig: Option<&Path>, namespace: Option<&str>) -> ClusterResult<Self> {
        crate::proxy::tls::ensure_crypto_provider();
        let config = match kubeconfig {
            Some(path) => {
                let kc = Kubeconfig::read_from(path).map_err(|e| {
                    ClusterError::Api(format!("read kubeconfig {}: {}", path.display(), e))
                })?;
                Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ClusterError::Api(format!("load kubeconfig: {}", e)))?
            }
            None => Config::infer()
                .await
                .map_err(|e| ClusterError::Api(format!("infer kubeconfig: {}", e)))?,
        };
        let namespace = namespace
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| config.default_namespace.clone());
        let client = Client::try_from(config)
            .map_err(|e| ClusterError::Api(format!("create client: {}", e)))?;
        log::debug!("connected to cluster, namespace {}", namespace);
        Ok(Self { client, namespace })
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn dynamic(&self, kind: &WorkloadKind) -> ClusterResult<Api<DynamicObject>> {
        let resource = match kind {
            WorkloadKind::Deployment => ApiResource::erase::<Deployment>(&()),
            WorkloadKind::StatefulSet => ApiResource::erase::<StatefulSet>(&()),
            WorkloadKind::ReplicaSet => ApiResource::erase::<ReplicaSet>(&()),
            WorkloadKind::DaemonSet => ApiResource::erase::<DaemonSet>(&()),
            WorkloadKind::Service => ApiResource::erase::<Service>(&()),
            WorkloadKind::Pod => ApiResource::erase::<Pod>(&()),
            WorkloadKind::Custom(name) => self.discover(name).await?,
        };
        Ok(Api::namespaced_with(
            self.client.clone(),
            &self.namespace,
            &resource,
        ))
    }

    /// Find a served resource whose kind or plural matches `name`.
    async fn discover(&self, name: &str) -> ClusterResult<ApiResource> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| map_kube_error("discovery", e))?;
        for group in discovery.groups() {
            for (resource, _caps) in group.recommended_resources() {
                if resource.kind.eq_ignore_ascii_case(name)
                    || resource.plural.eq_ignore_ascii_case(name)
                {
                    return Ok(resource);
                }
            }
        }
        Err(ClusterError::NotFound(format!("resource kind {}", name)))
    }
}

// ============================================================================
// Conversions
// ============================================================================

fn map_kube_error(what: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(what.to_string()),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            ClusterError::AlreadyExists(what.to_string())
        }
        kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict(what.to_string()),
        other => ClusterError::Api(format!("{}: {}", what, other)),
    }
}

fn config_map_record(cm: ConfigMap) -> ConfigMapRecord {
    ConfigMapRecord {
        name: cm.metadata.name.unwrap_or_default(),
        data: cm.data.unwrap_or_default(),
        resource_version: cm.metadata.resource_version,
    }
}

fn config_map(record: &ConfigMapRecord) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(record.name.clone()),
            resource_version: record.resource_version.clone(),
            ..Default::default()
        },
        data: Some(record.data.clone()),
        ..Default::default()
    }
}

fn pod_record(pod: Pod) -> PodRecord {
    let status = pod.status.unwrap_or_default();
    PodRecord {
        name: pod.metadata.name.unwrap_or_default(),
        labels: pod.metadata.labels.unwrap_or_default(),
        annotations: pod.metadata.annotations.unwrap_or_default(),
        phase: status.phase.unwrap_or_default(),
        pod_ip: status.pod_ip,
        terminating: pod.metadata.deletion_timestamp.is_some(),
        resource_version: pod.metadata.resource_version,
    }
}

fn quantities(values: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if values.is_empty() {
        return None;
    }
    Some(
        values
            .iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect(),
    )
}

fn pod_from_manifest(manifest: &PodManifest) -> Pod {
    let ports = manifest
        .ports
        .iter()
        .map(|p| ContainerPort {
            name: p.name.clone(),
            container_port: p.container_port,
            protocol: p.protocol.clone(),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let container = Container {
        name: manifest.container_name.clone(),
        image: Some(manifest.image.clone()),
        image_pull_policy: Some("IfNotPresent".into()),
        command: Some(manifest.command.clone()),
        args: Some(manifest.args.clone()),
        ports: (!ports.is_empty()).then_some(ports),
        security_context: Some(SecurityContext {
            privileged: Some(manifest.privileged),
            run_as_user: Some(0),
            capabilities: Some(Capabilities {
                add: Some(manifest.capabilities.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        resources: Some(ResourceRequirements {
            requests: quantities(&manifest.requests),
            limits: quantities(&manifest.limits),
            ..Default::default()
        }),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(manifest.name.clone()),
            labels: Some(manifest.labels.clone()),
            annotations: Some(manifest.annotations.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            priority_class_name: manifest.priority_class.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// ClusterApi
// ============================================================================

#[async_trait]
impl ClusterApi for KubeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_config_map(&self, name: &str) -> ClusterResult<ConfigMapRecord> {
        let what = format!("configmap {}", name);
        let cm = self
            .config_maps()
            .get(name)
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        Ok(config_map_record(cm))
    }

    async fn create_config_map(&self, cm: &ConfigMapRecord) -> ClusterResult<ConfigMapRecord> {
        let what = format!("configmap {}", cm.name);
        let mut object = config_map(cm);
        object.metadata.resource_version = None;
        let created = self
            .config_maps()
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        Ok(config_map_record(created))
    }

    async fn replace_config_map(&self, cm: &ConfigMapRecord) -> ClusterResult<ConfigMapRecord> {
        let what = format!("configmap {}", cm.name);
        let replaced = self
            .config_maps()
            .replace(&cm.name, &PostParams::default(), &config_map(cm))
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        Ok(config_map_record(replaced))
    }

    async fn delete_config_map(&self, name: &str) -> ClusterResult<()> {
        let what = format!("configmap {}", name);
        self.config_maps()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        Ok(())
    }

    async fn get_pod(&self, name: &str) -> ClusterResult<PodRecord> {
        let what = format!("pod {}", name);
        let pod = self
            .pods()
            .get(name)
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        Ok(pod_record(pod))
    }

    async fn list_pods(&self, selector: &BTreeMap<String, String>) -> ClusterResult<Vec<PodRecord>> {
        let params = if selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(&label_selector(selector))
        };
        let pods = self
            .pods()
            .list(&params)
            .await
            .map_err(|e| map_kube_error("pods", e))?;
        Ok(pods.items.into_iter().map(pod_record).collect())
    }

    async fn create_pod(&self, manifest: &PodManifest) -> ClusterResult<PodRecord> {
        let what = format!("pod {}", manifest.name);
        let pod = self
            .pods()
            .create(&PostParams::default(), &pod_from_manifest(manifest))
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        Ok(pod_record(pod))
    }

    async fn wait_pod_running(&self, name: &str, timeout: Duration) -> ClusterResult<PodRecord> {
        let poll = async {
            loop {
                let pod = self.get_pod(name).await?;
                if pod.is_running() {
                    return Ok(pod);
                }
                if pod.phase == "Failed" || pod.phase == "Succeeded" {
                    return Err(ClusterError::Api(format!(
                        "pod {} is {}, not running",
                        name, pod.phase
                    )));
                }
                log::debug!("waiting for pod {} ({})", name, pod.phase);
                tokio::time::sleep(POD_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            ClusterError::Api(format!("pod {} not running after {:?}", name, timeout))
        })?
    }

    async fn patch_pod_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
        resource_version: Option<&str>,
    ) -> ClusterResult<PodRecord> {
        let what = format!("pod {}", name);
        let mut metadata = json!({ "annotations": annotations });
        if let Some(rv) = resource_version {
            metadata["resourceVersion"] = json!(rv);
        }
        let patch = json!({ "metadata": metadata });
        let pod = self
            .pods()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        Ok(pod_record(pod))
    }

    async fn delete_pod(&self, name: &str) -> ClusterResult<()> {
        let what = format!("pod {}", name);
        self.pods()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        Ok(())
    }

    async fn exec(&self, pod: &str, command: &[String]) -> ClusterResult<String> {
        let what = format!("exec in pod {}", pod);
        let params = AttachParams::default().stdout(true).stderr(false);
        let mut attached = self
            .pods()
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(|e| map_kube_error(&what, e))?;

        let mut output = String::new();
        if let Some(mut stdout) = attached.stdout() {
            stdout
                .read_to_string(&mut output)
                .await
                .map_err(|e| ClusterError::Api(format!("{}: {}", what, e)))?;
        }
        attached
            .join()
            .await
            .map_err(|e| ClusterError::Api(format!("{}: {}", what, e)))?;
        Ok(output)
    }

    async fn port_forward(&self, pod: &str, port: u16) -> ClusterResult<IoStream> {
        let what = format!("port-forward {}:{}", pod, port);
        let mut forwarder = self
            .pods()
            .portforward(pod, &[port])
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| ClusterError::Api(format!("{}: no stream", what)))?;
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                log::debug!("{} ended: {}", what, e);
            }
        });
        Ok(Box::new(stream))
    }

    async fn node_pod_cidrs(&self) -> ClusterResult<Vec<String>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error("nodes", e))?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|n| n.spec.and_then(|s| s.pod_cidr))
            .filter(|cidr| !cidr.is_empty())
            .collect())
    }

    async fn service_cluster_ips(&self) -> ClusterResult<Vec<String>> {
        let list = self
            .services()
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error("services", e))?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|s| s.spec.and_then(|s| s.cluster_ip))
            .filter(|ip| !ip.is_empty() && ip != "None")
            .collect())
    }

    async fn get_service(&self, name: &str) -> ClusterResult<ServiceRecord> {
        let what = format!("service {}", name);
        let svc = self
            .services()
            .get(name)
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        let spec = svc.spec.unwrap_or_default();
        Ok(ServiceRecord {
            name: svc.metadata.name.unwrap_or_default(),
            selector: spec.selector.unwrap_or_default(),
            ports: spec
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|p| ServicePort {
                    target_port: match p.target_port {
                        Some(IntOrString::Int(port)) => Some(port),
                        _ => None,
                    },
                    name: p.name,
                    port: p.port,
                    protocol: p.protocol,
                })
                .collect(),
            cluster_ip: spec.cluster_ip,
        })
    }

    async fn get_object(&self, workload: &WorkloadRef) -> ClusterResult<serde_json::Value> {
        let what = workload.to_string();
        let object = self
            .dynamic(&workload.kind)
            .await?
            .get(&workload.name)
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        serde_json::to_value(object).map_err(|e| ClusterError::Api(format!("{}: {}", what, e)))
    }

    async fn create_object(&self, workload: &WorkloadRef, object: &serde_json::Value) -> ClusterResult<()> {
        let what = workload.to_string();
        let object: DynamicObject = serde_json::from_value(object.clone())
            .map_err(|e| ClusterError::Api(format!("{}: {}", what, e)))?;
        self.dynamic(&workload.kind)
            .await?
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        Ok(())
    }

    async fn delete_object(&self, workload: &WorkloadRef) -> ClusterResult<()> {
        let what = workload.to_string();
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        self.dynamic(&workload.kind)
            .await?
            .delete(&workload.name, &params)
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        Ok(())
    }

    async fn get_replicas(&self, workload: &WorkloadRef) -> ClusterResult<i32> {
        let what = workload.to_string();
        let scale = self
            .dynamic(&workload.kind)
            .await?
            .get_scale(&workload.name)
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        Ok(scale.spec.and_then(|s| s.replicas).unwrap_or(0))
    }

    async fn set_replicas(&self, workload: &WorkloadRef, replicas: i32) -> ClusterResult<()> {
        let what = workload.to_string();
        let patch = json!({ "spec": { "replicas": replicas } });
        self.dynamic(&workload.kind)
            .await?
            .patch_scale(&workload.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(&what, e))?;
        Ok(())
    }
}
