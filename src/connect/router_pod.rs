//! The shared outbound router pod.
//!
//! One router pod per namespace NATs tunnel traffic into the cluster. Its
//! `ref-count` annotation counts the sessions using it; the last session
//! to leave deletes it along with the address pool.

use crate::cluster::{ClusterApi, ClusterError, PodManifest, PodRecord};
use crate::dhcp::{self, TRAFFIC_MANAGER};
use crate::error::{VpnError, VpnResult};
use ipnet::Ipv4Net;
use std::collections::BTreeMap;
use std::time::Duration;

pub const REF_COUNT_ANNOTATION: &str = "ref-count";
pub const ROUTER_CONTAINER: &str = "vpn";
const MAX_REF_COUNT_ATTEMPTS: usize = 10;
const DELETE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shell script run by the router container.
pub fn router_script(cidrs: &[Ipv4Net], control_port: u16, tun_port: u16) -> String {
    let router_net = dhcp::router_address().trunc();
    let mut steps = vec![
        "sysctl net.ipv4.ip_forward=1".to_string(),
        "iptables -F".to_string(),
        "iptables -P INPUT ACCEPT".to_string(),
        "iptables -P FORWARD ACCEPT".to_string(),
    ];
    for net in std::iter::once(&router_net).chain(cidrs) {
        steps.push(format!(
            "iptables -t nat -A POSTROUTING -s {} -o eth0 -j MASQUERADE",
            net
        ));
    }
    steps.push(format!(
        "kubetun serve -L tcp://:{} -L 'tun://:{}?net={}' --debug",
        control_port,
        tun_port,
        dhcp::router_address()
    ));
    steps.join(";")
}

pub fn router_pod_manifest(
    image: &str,
    cidrs: &[Ipv4Net],
    control_port: u16,
    tun_port: u16,
) -> PodManifest {
    PodManifest {
        name: TRAFFIC_MANAGER.to_string(),
        labels: BTreeMap::from([("app".to_string(), TRAFFIC_MANAGER.to_string())]),
        annotations: BTreeMap::from([(REF_COUNT_ANNOTATION.to_string(), "1".to_string())]),
        container_name: ROUTER_CONTAINER.to_string(),
        image: image.to_string(),
        command: vec!["/bin/sh".into(), "-c".into()],
        args: vec![router_script(cidrs, control_port, tun_port)],
        ports: Vec::new(),
        privileged: true,
        capabilities: vec!["NET_ADMIN".into()],
        requests: BTreeMap::from([
            ("cpu".to_string(), "128m".to_string()),
            ("memory".to_string(), "256Mi".to_string()),
        ]),
        limits: BTreeMap::from([
            ("cpu".to_string(), "256m".to_string()),
            ("memory".to_string(), "512Mi".to_string()),
        ]),
        priority_class: Some("system-cluster-critical".into()),
    }
}

/// Reuse the router pod (taking a reference) or create it, then wait for
/// it to run.
pub async fn ensure_router_pod(
    cluster: &dyn ClusterApi,
    manifest: &PodManifest,
    timeout: Duration,
) -> VpnResult<PodRecord> {
    match cluster.get_pod(&manifest.name).await {
        Ok(pod) if !pod.terminating => {
            let count = update_ref_count(cluster, 1).await?;
            log::info!("router pod already exists, {} session(s)", count);
            return wait_or_release(cluster, &manifest.name, timeout).await;
        }
        Ok(_) => {
            log::info!("router pod is terminating, waiting before recreating it");
            wait_pod_deleted(cluster, &manifest.name, timeout).await?;
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    log::info!("creating router pod {}", manifest.name);
    match cluster.create_pod(manifest).await {
        Ok(_) => {}
        Err(ClusterError::AlreadyExists(_)) => {
            update_ref_count(cluster, 1).await?;
        }
        Err(e) => return Err(e.into()),
    }
    wait_or_release(cluster, &manifest.name, timeout).await
}

/// Wait for the router pod to run. On failure the reference just taken is
/// dropped again.
async fn wait_or_release(
    cluster: &dyn ClusterApi,
    name: &str,
    timeout: Duration,
) -> VpnResult<PodRecord> {
    match cluster.wait_pod_running(name, timeout).await {
        Ok(pod) => Ok(pod),
        Err(e) => {
            log::warn!("router pod {} did not start: {}", name, e);
            if let Err(release) = release_router_pod(cluster).await {
                log::warn!("release router pod: {}", release);
            }
            Err(e.into())
        }
    }
}

pub(crate) async fn wait_pod_deleted(cluster: &dyn ClusterApi, name: &str, timeout: Duration) -> VpnResult<()> {
    let poll = async {
        loop {
            match cluster.get_pod(name).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(VpnError::from(e)),
                Ok(_) => tokio::time::sleep(DELETE_POLL_INTERVAL).await,
            }
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| VpnError::Timeout(format!("pod {} still terminating", name)))?
}

/// Add `delta` to the router pod's reference count. Returns the new count.
pub async fn update_ref_count(cluster: &dyn ClusterApi, delta: i64) -> VpnResult<i64> {
    for attempt in 1..=MAX_REF_COUNT_ATTEMPTS {
        let pod = cluster.get_pod(TRAFFIC_MANAGER).await?;
        let current: i64 = pod
            .annotation(REF_COUNT_ANNOTATION)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                VpnError::config(format!("router pod has no {} annotation", REF_COUNT_ANNOTATION))
            })?;
        let next = current + delta;
        let patch = BTreeMap::from([(REF_COUNT_ANNOTATION.to_string(), Some(next.to_string()))]);
        match cluster
            .patch_pod_annotations(TRAFFIC_MANAGER, &patch, pod.resource_version.as_deref())
            .await
        {
            Ok(_) => {
                log::debug!("router pod ref-count {} -> {}", current, next);
                return Ok(next);
            }
            Err(e) if e.is_conflict() => {
                log::debug!("ref-count update conflicted (attempt {})", attempt);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(VpnError::Cluster(ClusterError::Conflict(format!(
        "{} ref-count",
        TRAFFIC_MANAGER
    ))))
}

/// Drop this session's reference. The last one out deletes the router pod
/// and the address pool.
pub async fn release_router_pod(cluster: &dyn ClusterApi) -> VpnResult<()> {
    let remaining = update_ref_count(cluster, -1).await?;
    if remaining > 0 {
        log::info!("router pod still used by {} session(s)", remaining);
        return Ok(());
    }
    log::info!("last session left, deleting router pod and address pool");
    match cluster.delete_pod(TRAFFIC_MANAGER).await {
        Err(e) if !e.is_not_found() => return Err(e.into()),
        _ => {}
    }
    match cluster.delete_config_map(TRAFFIC_MANAGER).await {
        Err(e) if !e.is_not_found() => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::cluster::ConfigMapRecord;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn manifest() -> PodManifest {
        router_pod_manifest("kubetun:test", &["10.244.0.0/16".parse().unwrap()], 10800, 8421)
    }

    #[test]
    fn test_router_script() {
        let script = router_script(&["10.96.0.0/24".parse().unwrap()], 10800, 8421);
        assert!(script.starts_with("sysctl net.ipv4.ip_forward=1;"));
        assert!(script.contains("-s 223.254.254.0/24 -o eth0 -j MASQUERADE"));
        assert!(script.contains("-s 10.96.0.0/24 -o eth0 -j MASQUERADE"));
        assert!(script.ends_with("kubetun serve -L tcp://:10800 -L 'tun://:8421?net=223.254.254.100/24' --debug"));
    }

    #[tokio::test]
    async fn test_ref_counted_lifecycle() {
        let cluster = InMemoryCluster::default();
        cluster
            .create_config_map(&ConfigMapRecord::new(TRAFFIC_MANAGER))
            .await
            .unwrap();

        let first = ensure_router_pod(&cluster, &manifest(), TIMEOUT).await.unwrap();
        assert!(first.is_running());
        assert_eq!(first.annotation(REF_COUNT_ANNOTATION), Some("1"));
        let spec = cluster.manifest(TRAFFIC_MANAGER).unwrap();
        assert!(spec.privileged);
        assert_eq!(spec.limits["memory"], "512Mi");

        ensure_router_pod(&cluster, &manifest(), TIMEOUT).await.unwrap();
        assert_eq!(
            cluster.pod(TRAFFIC_MANAGER).unwrap().annotation(REF_COUNT_ANNOTATION),
            Some("2")
        );

        release_router_pod(&cluster).await.unwrap();
        assert!(cluster.pod(TRAFFIC_MANAGER).is_some());
        release_router_pod(&cluster).await.unwrap();
        assert!(cluster.pod(TRAFFIC_MANAGER).is_none());
        assert!(cluster.config_map(TRAFFIC_MANAGER).is_none());
    }

    #[tokio::test]
    async fn test_ref_count_requires_annotation() {
        let cluster = InMemoryCluster::default();
        cluster.insert_pod(PodRecord {
            name: TRAFFIC_MANAGER.into(),
            phase: "Running".into(),
            ..Default::default()
        });
        assert!(update_ref_count(&cluster, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_pending_router_pod_keeps_ref_count() {
        let cluster = InMemoryCluster::default();
        cluster.insert_pod(PodRecord {
            name: TRAFFIC_MANAGER.into(),
            phase: "Pending".into(),
            annotations: BTreeMap::from([(REF_COUNT_ANNOTATION.to_string(), "1".to_string())]),
            ..Default::default()
        });

        assert!(ensure_router_pod(&cluster, &manifest(), TIMEOUT).await.is_err());
        assert_eq!(
            cluster.pod(TRAFFIC_MANAGER).unwrap().annotation(REF_COUNT_ANNOTATION),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_created_router_pod_removed_when_not_running() {
        let cluster = InMemoryCluster::default();
        cluster
            .create_config_map(&ConfigMapRecord::new(TRAFFIC_MANAGER))
            .await
            .unwrap();
        cluster.set_created_pod_phase("Pending");

        assert!(ensure_router_pod(&cluster, &manifest(), TIMEOUT).await.is_err());
        assert!(cluster.pod(TRAFFIC_MANAGER).is_none());
    }
}
