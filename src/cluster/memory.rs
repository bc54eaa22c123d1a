//! In-memory [`ClusterApi`] for tests.

use super::{
    ClusterApi, ClusterError, ClusterResult, ConfigMapRecord, PodManifest, PodRecord,
    ServiceRecord, WorkloadRef,
};
use crate::proxy::transport::IoStream;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct State {
    version: u64,
    mutations: usize,
    conflicts_pending: usize,
    fail_pod_creates: bool,
    created_pod_phase: Option<String>,
    config_maps: HashMap<String, ConfigMapRecord>,
    pods: BTreeMap<String, PodRecord>,
    manifests: HashMap<String, PodManifest>,
    services: HashMap<String, ServiceRecord>,
    objects: HashMap<WorkloadRef, serde_json::Value>,
    exec_output: HashMap<String, String>,
    node_cidrs: Vec<String>,
    service_ips: Vec<String>,
    forward_target: Option<SocketAddr>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.mutations += 1;
        self.version.to_string()
    }
}

/// Namespace-scoped fake cluster with resource versions.
pub struct InMemoryCluster {
    namespace: String,
    state: Mutex<State>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new("default")
    }
}

impl InMemoryCluster {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            state: Mutex::new(State::default()),
        }
    }

    /// Fail the next `n` config map replaces with a conflict.
    pub fn inject_conflicts(&self, n: usize) {
        self.state.lock().unwrap().conflicts_pending = n;
    }

    pub fn fail_pod_creates(&self, fail: bool) {
        self.state.lock().unwrap().fail_pod_creates = fail;
    }

    /// Phase given to pods created from now on (default `Running`).
    pub fn set_created_pod_phase(&self, phase: &str) {
        self.state.lock().unwrap().created_pod_phase = Some(phase.to_string());
    }

    /// Successful writes so far.
    pub fn mutations(&self) -> usize {
        self.state.lock().unwrap().mutations
    }

    pub fn config_map(&self, name: &str) -> Option<ConfigMapRecord> {
        self.state.lock().unwrap().config_maps.get(name).cloned()
    }

    pub fn pod(&self, name: &str) -> Option<PodRecord> {
        self.state.lock().unwrap().pods.get(name).cloned()
    }

    pub fn manifest(&self, name: &str) -> Option<PodManifest> {
        self.state.lock().unwrap().manifests.get(name).cloned()
    }

    pub fn insert_pod(&self, mut pod: PodRecord) {
        let mut state = self.state.lock().unwrap();
        pod.resource_version = Some(state.next_version());
        state.pods.insert(pod.name.clone(), pod);
    }

    pub fn object(&self, workload: &WorkloadRef) -> Option<serde_json::Value> {
        self.state.lock().unwrap().objects.get(workload).cloned()
    }

    pub fn insert_object(&self, workload: WorkloadRef, object: serde_json::Value) {
        self.state.lock().unwrap().objects.insert(workload, object);
    }

    pub fn insert_service(&self, service: ServiceRecord) {
        self.state
            .lock()
            .unwrap()
            .services
            .insert(service.name.clone(), service);
    }

    pub fn set_exec_output(&self, pod: &str, output: &str) {
        self.state
            .lock()
            .unwrap()
            .exec_output
            .insert(pod.to_string(), output.to_string());
    }

    pub fn set_node_cidrs(&self, cidrs: &[&str]) {
        self.state.lock().unwrap().node_cidrs = cidrs.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_service_ips(&self, ips: &[&str]) {
        self.state.lock().unwrap().service_ips = ips.iter().map(|s| s.to_string()).collect();
    }

    /// Port-forwards connect to this local address instead.
    pub fn set_forward_target(&self, addr: SocketAddr) {
        self.state.lock().unwrap().forward_target = Some(addr);
    }

    pub fn replicas(&self, workload: &WorkloadRef) -> Option<i64> {
        self.object(workload)
            .and_then(|o| o.pointer("/spec/replicas").and_then(|r| r.as_i64()))
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_config_map(&self, name: &str) -> ClusterResult<ConfigMapRecord> {
        self.config_map(name)
            .ok_or_else(|| ClusterError::NotFound(format!("configmap {}", name)))
    }

    async fn create_config_map(&self, cm: &ConfigMapRecord) -> ClusterResult<ConfigMapRecord> {
        let mut state = self.state.lock().unwrap();
        if state.config_maps.contains_key(&cm.name) {
            return Err(ClusterError::AlreadyExists(format!("configmap {}", cm.name)));
        }
        let mut created = cm.clone();
        created.resource_version = Some(state.next_version());
        state.config_maps.insert(cm.name.clone(), created.clone());
        Ok(created)
    }

    async fn replace_config_map(&self, cm: &ConfigMapRecord) -> ClusterResult<ConfigMapRecord> {
        let mut state = self.state.lock().unwrap();
        if state.conflicts_pending > 0 {
            state.conflicts_pending -= 1;
            return Err(ClusterError::Conflict(format!("configmap {}", cm.name)));
        }
        let current = state
            .config_maps
            .get(&cm.name)
            .ok_or_else(|| ClusterError::NotFound(format!("configmap {}", cm.name)))?;
        if cm.resource_version.is_some() && cm.resource_version != current.resource_version {
            return Err(ClusterError::Conflict(format!("configmap {}", cm.name)));
        }
        let mut replaced = cm.clone();
        replaced.resource_version = Some(state.next_version());
        state.config_maps.insert(cm.name.clone(), replaced.clone());
        Ok(replaced)
    }

    async fn delete_config_map(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .config_maps
            .remove(name)
            .ok_or_else(|| ClusterError::NotFound(format!("configmap {}", name)))?;
        state.mutations += 1;
        Ok(())
    }

    async fn get_pod(&self, name: &str) -> ClusterResult<PodRecord> {
        self.pod(name)
            .ok_or_else(|| ClusterError::NotFound(format!("pod {}", name)))
    }

    async fn list_pods(&self, selector: &BTreeMap<String, String>) -> ClusterResult<Vec<PodRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .values()
            .filter(|p| selector.iter().all(|(k, v)| p.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn create_pod(&self, manifest: &PodManifest) -> ClusterResult<PodRecord> {
        let mut state = self.state.lock().unwrap();
        if state.fail_pod_creates {
            return Err(ClusterError::Api(format!("pod {} rejected", manifest.name)));
        }
        if state.pods.contains_key(&manifest.name) {
            return Err(ClusterError::AlreadyExists(format!("pod {}", manifest.name)));
        }
        let ip = format!("10.244.0.{}", state.pods.len() + 10);
        let pod = PodRecord {
            name: manifest.name.clone(),
            labels: manifest.labels.clone(),
            annotations: manifest.annotations.clone(),
            phase: state
                .created_pod_phase
                .clone()
                .unwrap_or_else(|| "Running".into()),
            pod_ip: Some(ip),
            terminating: false,
            resource_version: Some(state.next_version()),
        };
        state.pods.insert(pod.name.clone(), pod.clone());
        state.manifests.insert(manifest.name.clone(), manifest.clone());
        Ok(pod)
    }

    async fn wait_pod_running(&self, name: &str, _timeout: Duration) -> ClusterResult<PodRecord> {
        let pod = self.get_pod(name).await?;
        if pod.is_running() {
            Ok(pod)
        } else {
            Err(ClusterError::Api(format!("pod {} is {}", name, pod.phase)))
        }
    }

    async fn patch_pod_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
        resource_version: Option<&str>,
    ) -> ClusterResult<PodRecord> {
        let mut state = self.state.lock().unwrap();
        let version = {
            let pod = state
                .pods
                .get(name)
                .ok_or_else(|| ClusterError::NotFound(format!("pod {}", name)))?;
            if let Some(rv) = resource_version {
                if pod.resource_version.as_deref() != Some(rv) {
                    return Err(ClusterError::Conflict(format!("pod {}", name)));
                }
            }
            state.next_version()
        };
        let pod = state
            .pods
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound(format!("pod {}", name)))?;
        for (key, value) in annotations {
            match value {
                Some(v) => pod.annotations.insert(key.clone(), v.clone()),
                None => pod.annotations.remove(key),
            };
        }
        pod.resource_version = Some(version);
        Ok(pod.clone())
    }

    async fn delete_pod(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .pods
            .remove(name)
            .ok_or_else(|| ClusterError::NotFound(format!("pod {}", name)))?;
        state.manifests.remove(name);
        state.mutations += 1;
        Ok(())
    }

    async fn exec(&self, pod: &str, _command: &[String]) -> ClusterResult<String> {
        let state = self.state.lock().unwrap();
        if !state.pods.contains_key(pod) {
            return Err(ClusterError::NotFound(format!("pod {}", pod)));
        }
        Ok(state.exec_output.get(pod).cloned().unwrap_or_default())
    }

    async fn port_forward(&self, pod: &str, _port: u16) -> ClusterResult<IoStream> {
        let target = {
            let state = self.state.lock().unwrap();
            if !state.pods.contains_key(pod) {
                return Err(ClusterError::NotFound(format!("pod {}", pod)));
            }
            state.forward_target
        };
        let target = target.ok_or_else(|| ClusterError::Api("no forward target".into()))?;
        let stream = tokio::net::TcpStream::connect(target)
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        Ok(Box::new(stream))
    }

    async fn node_pod_cidrs(&self) -> ClusterResult<Vec<String>> {
        Ok(self.state.lock().unwrap().node_cidrs.clone())
    }

    async fn service_cluster_ips(&self) -> ClusterResult<Vec<String>> {
        Ok(self.state.lock().unwrap().service_ips.clone())
    }

    async fn get_service(&self, name: &str) -> ClusterResult<ServiceRecord> {
        self.state
            .lock()
            .unwrap()
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("service {}", name)))
    }

    async fn get_object(&self, workload: &WorkloadRef) -> ClusterResult<serde_json::Value> {
        self.object(workload)
            .ok_or_else(|| ClusterError::NotFound(workload.to_string()))
    }

    async fn create_object(&self, workload: &WorkloadRef, object: &serde_json::Value) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.objects.contains_key(workload) {
            return Err(ClusterError::AlreadyExists(workload.to_string()));
        }
        state.objects.insert(workload.clone(), object.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn delete_object(&self, workload: &WorkloadRef) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .objects
            .remove(workload)
            .ok_or_else(|| ClusterError::NotFound(workload.to_string()))?;
        state.mutations += 1;
        Ok(())
    }

    async fn get_replicas(&self, workload: &WorkloadRef) -> ClusterResult<i32> {
        let object = self.get_object(workload).await?;
        object
            .pointer("/spec/replicas")
            .and_then(|r| r.as_i64())
            .map(|r| r as i32)
            .ok_or_else(|| ClusterError::Api(format!("{} has no scale", workload)))
    }

    async fn set_replicas(&self, workload: &WorkloadRef, replicas: i32) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        let object = state
            .objects
            .get_mut(workload)
            .ok_or_else(|| ClusterError::NotFound(workload.to_string()))?;
        if object.pointer("/spec/replicas").is_none() {
            return Err(ClusterError::Api(format!("{} has no scale", workload)));
        }
        object["spec"]["replicas"] = serde_json::json!(replicas);
        state.mutations += 1;
        Ok(())
    }
}
