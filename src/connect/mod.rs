//! Connect orchestration.
//!
//! A session moves through `prepare` (CIDR discovery, address pool, TUN
//! lease), `do_connect` (router pod, port-forward, local TUN router, DNS,
//! heartbeat) and optionally `do_reverse` (shadow pods for workloads).
//! Everything that has to be undone is pushed onto the session's
//! [`CleanupStack`]; `disconnect` runs it.

pub mod heartbeat;
pub mod port_forward;
pub mod router_pod;
pub mod session;

use crate::cluster::{ClusterApi, ClusterError, WorkloadRef};
use crate::config::{Config, DnsConfig, TunnelConfig};
use crate::dhcp::{self, DhcpManager, LeaseStrategy, TRAFFIC_MANAGER};
use crate::error::{VpnError, VpnResult};
use crate::reverse::{self, ShadowSpec};
use crate::route::{self, Route};
use crate::tun::TUN_NAME_ENV;
use ipnet::Ipv4Net;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use port_forward::{wait_port_free, PortForwarder};
pub use session::{CleanupStack, SessionGuard, SessionState};

const PORT_FREE_TIMEOUT: Duration = Duration::from_secs(5);
const NODE_PREFIX: u8 = 16;
const SERVICE_PREFIX: u8 = 24;
const POD_PREFIX: u8 = 16;

fn masked(addr: Ipv4Addr, prefix: u8) -> Option<Ipv4Net> {
    Ipv4Net::new(addr, prefix).ok().map(|n| n.trunc())
}

/// Networks to route through the tunnel: node pod CIDRs widened to /16,
/// service IPs as /24 and pod IPs as /16, first occurrence kept.
pub async fn discover_cidrs(cluster: &dyn ClusterApi) -> VpnResult<Vec<Ipv4Net>> {
    let mut found = Vec::new();

    match cluster.node_pod_cidrs().await {
        Ok(cidrs) => found.extend(
            cidrs
                .iter()
                .filter_map(|c| c.parse::<Ipv4Net>().ok())
                .filter_map(|n| masked(n.addr(), NODE_PREFIX)),
        ),
        Err(e) => log::warn!("cannot list node CIDRs: {}", e),
    }
    match cluster.service_cluster_ips().await {
        Ok(ips) => found.extend(
            ips.iter()
                .filter_map(|ip| ip.parse::<Ipv4Addr>().ok())
                .filter_map(|ip| masked(ip, SERVICE_PREFIX)),
        ),
        Err(e) => log::warn!("cannot list service IPs: {}", e),
    }
    match cluster.list_pods(&BTreeMap::new()).await {
        Ok(pods) => found.extend(
            pods.iter()
                .filter_map(|p| p.pod_ip.as_deref()?.parse::<Ipv4Addr>().ok())
                .filter_map(|ip| masked(ip, POD_PREFIX)),
        ),
        Err(e) => log::warn!("cannot list pods: {}", e),
    }

    let mut cidrs: Vec<Ipv4Net> = Vec::with_capacity(found.len());
    for net in found {
        if !cidrs.contains(&net) {
            cidrs.push(net);
        }
    }
    if cidrs.is_empty() {
        return Err(VpnError::config(format!(
            "no cluster CIDR found in namespace {}",
            cluster.namespace()
        )));
    }
    Ok(cidrs)
}

/// `-L` node of the local TUN router.
pub fn local_serve_node(tun_ip: Ipv4Net, cidrs: &[Ipv4Net], tun_port: u16, mtu: u16) -> String {
    let routes = std::iter::once(dhcp::router_address())
        .chain(cidrs.iter().copied())
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let mut node = format!(
        "tun://:{port}/127.0.0.1:{port}?net={}&route={}",
        tun_ip,
        routes,
        port = tun_port
    );
    if mtu > 0 {
        node.push_str(&format!("&mtu={}", mtu));
    }
    node
}

fn ignore_missing_pool(result: VpnResult<()>) -> VpnResult<()> {
    match result {
        Err(VpnError::Cluster(ClusterError::NotFound(_))) => Ok(()),
        other => other,
    }
}

/// One connect session against one namespace.
pub struct ConnectOptions {
    cluster: Arc<dyn ClusterApi>,
    tunnel: TunnelConfig,
    dns: DnsConfig,
    pub workloads: Vec<WorkloadRef>,
    dhcp: Arc<DhcpManager>,
    session: Arc<SessionState>,
    guard: Option<SessionGuard>,
    cleanups: CleanupStack,
    token: CancellationToken,
    cidrs: Vec<Ipv4Net>,
    tun_ip: Option<Ipv4Net>,
    router_pod_ip: Option<String>,
    shadow_ips: Vec<Ipv4Net>,
}

impl ConnectOptions {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        config: &Config,
        workloads: Vec<WorkloadRef>,
        mac: impl Into<String>,
        session: Arc<SessionState>,
    ) -> Self {
        let dhcp = Arc::new(DhcpManager::new(cluster.clone(), mac));
        Self {
            cluster,
            tunnel: config.tunnel(),
            dns: config.dns(),
            workloads,
            dhcp,
            session,
            guard: None,
            cleanups: CleanupStack::new(),
            token: CancellationToken::new(),
            cidrs: Vec::new(),
            tun_ip: None,
            router_pod_ip: None,
            shadow_ips: Vec::new(),
        }
    }

    pub fn cidrs(&self) -> &[Ipv4Net] {
        &self.cidrs
    }

    pub fn tun_ip(&self) -> Option<Ipv4Net> {
        self.tun_ip
    }

    pub fn router_pod_ip(&self) -> Option<&str> {
        self.router_pod_ip.as_deref()
    }

    pub fn shadow_ips(&self) -> &[Ipv4Net] {
        &self.shadow_ips
    }

    /// Cancelled when the session is torn down.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Claim the session, discover cluster CIDRs, make sure the address
    /// pool exists and lease this machine's TUN address.
    pub async fn prepare(&mut self) -> VpnResult<()> {
        if self.guard.is_none() {
            self.guard = Some(self.session.try_begin()?);
        }
        let prepared = self.prepare_inner().await;
        if prepared.is_err() && self.cleanups.is_empty() {
            self.guard = None;
        }
        prepared
    }

    async fn prepare_inner(&mut self) -> VpnResult<()> {
        self.cidrs = discover_cidrs(self.cluster.as_ref()).await?;
        log::info!("cluster CIDRs: {:?}", self.cidrs);

        self.dhcp.init_if_necessary().await?;
        let random = self.tunnel.random_lease();
        let tun_ip = if random {
            self.dhcp.rent_ip(LeaseStrategy::Random).await?
        } else {
            self.dhcp.rent_ip_for_mac().await?
        };
        self.tun_ip = Some(tun_ip);
        log::info!("your ip is {}", tun_ip.addr());

        let dhcp = self.dhcp.clone();
        self.cleanups.push(format!("release {}", tun_ip), move || async move {
            let released = if random {
                dhcp.release_ips(&[tun_ip.addr()]).await
            } else {
                dhcp.release_ip_for_mac().await
            };
            ignore_missing_pool(released)
        });
        Ok(())
    }

    /// Lease an extra address from the pool.
    pub async fn rent_ip(&self, strategy: LeaseStrategy) -> VpnResult<Ipv4Net> {
        self.dhcp.rent_ip(strategy).await
    }

    /// Bring the tunnel up. Returns a channel yielding errors of routers
    /// that stop. On failure everything already set up is torn down.
    pub async fn do_connect(&mut self) -> VpnResult<mpsc::UnboundedReceiver<VpnError>> {
        let tun_ip = self
            .tun_ip
            .ok_or_else(|| VpnError::config("connect before prepare"))?;

        match self.connect_inner(tun_ip).await {
            Ok(errors) => Ok(errors),
            Err(e) => {
                log::error!("connect failed: {}", e);
                self.disconnect().await;
                Err(e)
            }
        }
    }

    async fn connect_inner(&mut self, tun_ip: Ipv4Net) -> VpnResult<mpsc::UnboundedReceiver<VpnError>> {
        let control_port = self.tunnel.control_port();
        let tun_port = self.tunnel.tun_port();
        wait_port_free(control_port, PORT_FREE_TIMEOUT).await?;

        let manifest = router_pod::router_pod_manifest(
            &self.tunnel.image(),
            &self.cidrs,
            control_port,
            tun_port,
        );
        let router = router_pod::ensure_router_pod(
            self.cluster.as_ref(),
            &manifest,
            self.tunnel.pod_ready_timeout(),
        )
        .await?;
        let cluster = self.cluster.clone();
        self.cleanups.push("release router pod", move || async move {
            router_pod::release_router_pod(cluster.as_ref()).await
        });
        self.router_pod_ip = router.pod_ip.clone();

        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, control_port));
        PortForwarder::new(self.cluster.clone(), TRAFFIC_MANAGER, control_port)
            .start(local, self.token.child_token(), self.tunnel.port_forward_timeout())
            .await?;

        let route = Route::new(
            vec![local_serve_node(tun_ip, &self.cidrs, tun_port, self.tunnel.mtu())],
            format!("tcp://{}", local),
            self.tunnel.retries(),
        );
        let errors = route::start(self.token.clone(), &route).await?;
        log::info!("tunnel created");

        heartbeat::spawn_heartbeat(
            self.token.child_token(),
            IpAddr::V4(dhcp::router_address().addr()),
            self.tunnel.heartbeat_interval(),
        );

        if self.dns.enabled() {
            let tun_name = std::env::var(TUN_NAME_ENV)
                .map_err(|_| VpnError::tun_device(format!("{} is not set", TUN_NAME_ENV)))?;
            let listen = self
                .dns
                .listen
                .unwrap_or_else(|| SocketAddr::from((tun_ip.addr(), 53)));
            let dns = crate::dns::setup(
                self.cluster.as_ref(),
                TRAFFIC_MANAGER,
                &tun_name,
                listen,
                self.token.clone(),
            )
            .await?;
            self.cleanups.push("dns", move || async move {
                dns.stop().await;
                Ok(())
            });
            log::info!("DNS configured on {}", tun_name);
        }
        Ok(errors)
    }

    /// Redirect every configured workload to a shadow pod tunnelling to
    /// this machine. Keeps going after a failure and returns the first one.
    pub async fn do_reverse(&mut self) -> VpnResult<()> {
        let local_tun_ip = self
            .tun_ip
            .ok_or_else(|| VpnError::config("reverse before prepare"))?
            .addr();
        let router = self.cluster.get_pod(TRAFFIC_MANAGER).await?;
        let router_pod_ip = router
            .pod_ip
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| VpnError::config("router pod has no IP yet"))?;
        self.router_pod_ip = Some(router_pod_ip.clone());

        let mut first_error = None;
        for workload in self.workloads.clone() {
            let shadow_ip = match self.dhcp.rent_ip(LeaseStrategy::Random).await {
                Ok(ip) => ip,
                Err(e) => {
                    log::error!("no shadow address for {}: {}", workload, e);
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            let spec = ShadowSpec {
                image: self.tunnel.image(),
                tun_port: self.tunnel.tun_port(),
                local_tun_ip,
                router_pod_ip: router_pod_ip.clone(),
                shadow_ip,
                routes: vec![dhcp::router_address()],
            };
            match reverse::create_inbound_pod(
                &self.cluster,
                &workload,
                &spec,
                self.tunnel.pod_ready_timeout(),
            )
            .await
            {
                Ok(_) => {
                    log::info!("{} redirected via {}", workload, shadow_ip.addr());
                    self.shadow_ips.push(shadow_ip);
                    let cluster = self.cluster.clone();
                    let dhcp = self.dhcp.clone();
                    self.cleanups.push(format!("reset {}", workload), move || async move {
                        let removed = reverse::remove_inbound_pod(&cluster, &workload).await;
                        ignore_missing_pool(dhcp.release_ips(&[shadow_ip.addr()]).await)?;
                        removed
                    });
                }
                Err(e) => {
                    log::error!("reversing {} failed: {}", workload, e);
                    if let Err(release) = self.dhcp.release_ips(&[shadow_ip.addr()]).await {
                        log::warn!("release {}: {}", shadow_ip, release);
                    }
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear the session down. A no-op when nothing was set up. Returns how
    /// many cleanup steps failed.
    pub async fn disconnect(&mut self) -> usize {
        if self.guard.is_none() && self.cleanups.is_empty() {
            log::debug!("not connected");
            return 0;
        }
        self.token.cancel();
        let failed = self.cleanups.run_all().await;
        if failed > 0 {
            log::warn!("{} cleanup step(s) failed", failed);
        }
        self.shadow_ips.clear();
        self.tun_ip = None;
        self.guard = None;
        self.token = CancellationToken::new();
        failed
    }
}
