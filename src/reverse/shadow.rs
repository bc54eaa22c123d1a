//! Shadow pods: stand-ins that receive a redirected workload's traffic and
//! DNAT it through the tunnel to the developer's machine.

use super::{WorkloadController, ORIGIN_DATA_ANNOTATION};
use crate::cluster::{ClusterApi, ContainerPort, PodManifest, PodRecord, WorkloadRef};
use crate::connect::router_pod::{wait_pod_deleted, ROUTER_CONTAINER};
use crate::error::VpnResult;
use ipnet::Ipv4Net;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// Name of the shadow pod standing in for `workload`.
pub fn shadow_name(workload: &WorkloadRef) -> String {
    format!("{}-{}-shadow", workload.kind.resource(), workload.name)
}

/// Addresses wired into a shadow pod.
#[derive(Debug, Clone)]
pub struct ShadowSpec {
    pub image: String,
    pub tun_port: u16,
    /// The developer's TUN address; redirected traffic is DNATed here.
    pub local_tun_ip: Ipv4Addr,
    /// Pod IP of the router pod the shadow tunnels to.
    pub router_pod_ip: String,
    /// Leased address of the shadow pod's own TUN device.
    pub shadow_ip: Ipv4Net,
    pub routes: Vec<Ipv4Net>,
}

pub fn shadow_script(spec: &ShadowSpec) -> String {
    let routes = spec
        .routes
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(",");
    [
        "sysctl net.ipv4.ip_forward=1".to_string(),
        "iptables -F".to_string(),
        "iptables -P INPUT ACCEPT".to_string(),
        "iptables -P FORWARD ACCEPT".to_string(),
        format!(
            "iptables -t nat -A PREROUTING ! -p icmp -j DNAT --to {}",
            spec.local_tun_ip
        ),
        "iptables -t nat -A POSTROUTING ! -p icmp -j MASQUERADE".to_string(),
        "sysctl -w net.ipv4.conf.all.route_localnet=1".to_string(),
        format!(
            "iptables -t nat -A OUTPUT -o lo ! -p icmp -j DNAT --to-destination {}",
            spec.local_tun_ip
        ),
        format!(
            "kubetun serve -L 'tun://0.0.0.0:{port}/{router}:{port}?net={net}&route={routes}' --debug",
            port = spec.tun_port,
            router = spec.router_pod_ip,
            net = spec.shadow_ip,
            routes = routes
        ),
    ]
    .join(";")
}

pub fn shadow_pod_manifest(
    workload: &WorkloadRef,
    spec: &ShadowSpec,
    labels: BTreeMap<String, String>,
    ports: Vec<ContainerPort>,
    origin_data: String,
) -> PodManifest {
    PodManifest {
        name: shadow_name(workload),
        labels,
        annotations: BTreeMap::from([(ORIGIN_DATA_ANNOTATION.to_string(), origin_data)]),
        container_name: ROUTER_CONTAINER.to_string(),
        image: spec.image.clone(),
        command: vec!["/bin/sh".into(), "-c".into()],
        args: vec![shadow_script(spec)],
        ports,
        privileged: true,
        capabilities: vec!["NET_ADMIN".into()],
        requests: BTreeMap::from([
            ("cpu".to_string(), "128m".to_string()),
            ("memory".to_string(), "128Mi".to_string()),
        ]),
        limits: BTreeMap::from([
            ("cpu".to_string(), "256m".to_string()),
            ("memory".to_string(), "256Mi".to_string()),
        ]),
        priority_class: Some("system-cluster-critical".into()),
    }
}

/// Redirect `workload` to a shadow pod. An existing shadow pod is reused
/// as is; otherwise the workload is taken out of service and put back if
/// the shadow pod cannot be started.
pub async fn create_inbound_pod(
    cluster: &Arc<dyn ClusterApi>,
    workload: &WorkloadRef,
    spec: &ShadowSpec,
    ready_timeout: Duration,
) -> VpnResult<PodRecord> {
    let name = shadow_name(workload);
    match cluster.get_pod(&name).await {
        Ok(pod) if !pod.terminating => {
            log::info!("shadow pod {} already exists", name);
            return Ok(cluster.wait_pod_running(&name, ready_timeout).await?);
        }
        Ok(_) => {
            log::info!("shadow pod {} is terminating, waiting before recreating it", name);
            wait_pod_deleted(cluster.as_ref(), &name, ready_timeout).await?;
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    let controller = WorkloadController::new(cluster.clone());
    let captured = controller.scale_to_zero(workload).await?;
    let origin_data = captured.encode()?;
    let manifest = shadow_pod_manifest(
        workload,
        spec,
        captured.labels.clone(),
        captured.ports.clone(),
        origin_data,
    );

    log::info!("creating shadow pod {} for {}", name, workload);
    let created: VpnResult<PodRecord> = match cluster.create_pod(&manifest).await {
        Ok(_) => match cluster.wait_pod_running(&name, ready_timeout).await {
            Ok(pod) => Ok(pod),
            Err(e) => {
                // a shadow that never ran must not keep matching the workload's selector
                match cluster.delete_pod(&name).await {
                    Err(del) if !del.is_not_found() => {
                        log::warn!("delete shadow pod {}: {}", name, del)
                    }
                    _ => {}
                }
                Err(e.into())
            }
        },
        Err(e) => Err(e.into()),
    };
    match created {
        Ok(pod) => Ok(pod),
        Err(e) => {
            log::warn!("shadow pod {} failed ({}), restoring {}", name, e, workload);
            controller.restore(&captured.original).await;
            Err(e)
        }
    }
}

/// Restore `workload` and delete its shadow pod.
pub async fn remove_inbound_pod(cluster: &Arc<dyn ClusterApi>, workload: &WorkloadRef) -> VpnResult<()> {
    WorkloadController::new(cluster.clone()).reset(workload).await?;
    match cluster.delete_pod(&shadow_name(workload)).await {
        Err(e) if !e.is_not_found() => Err(e.into()),
        _ => Ok(()),
    }
}
