//! Layer-3 router between a TUN device and a datagram connection.
//!
//! In client mode (the node names a remote peer) every packet read from the
//! TUN is sent to that peer and every datagram received is written back to
//! the TUN. In server mode the handler learns which UDP peer owns each
//! source address and forwards packets between peers, falling back to the
//! local TUN when no peer owns the destination.

use crate::error::{VpnError, VpnResult};
use crate::proxy::buffer::BufferPool;
use crate::proxy::chain::Chain;
use crate::proxy::handler::{Accepted, Handler, HandlerOptions};
use crate::proxy::node::Node;
use crate::proxy::packet::parse_header;
use crate::proxy::packet_conn::{resolve_udp_addr, PacketConn};
use crate::tun::{IpRoute, TunConn, TunRead, TunWrite};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const RECONNECT_FIRST: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Delay before reconnect number `failures` (1-based): 1s doubling per
/// consecutive failure up to 30s, scaled by a random factor in [0.8, 1.2).
fn reconnect_delay(failures: u32, rng: &mut impl Rng) -> Duration {
    let doublings = failures.saturating_sub(1).min(5);
    let nominal = (RECONNECT_FIRST * (1u32 << doublings)).min(RECONNECT_MAX);
    nominal.mul_f64(rng.random_range(0.8..1.2))
}

// ============================================================================
// Route Table
// ============================================================================

/// Learned peer routes plus the static gateway routes of the node.
///
/// Keys are canonical IPs so an IPv4-mapped IPv6 source and its IPv4 form
/// share one entry.
#[derive(Debug, Default)]
pub struct RouteTable {
    learned: DashMap<IpAddr, SocketAddr>,
    static_routes: Vec<IpRoute>,
}

impl RouteTable {
    pub fn new(static_routes: Vec<IpRoute>) -> Self {
        Self {
            learned: DashMap::new(),
            static_routes,
        }
    }

    /// Record that `src` is reachable through `peer`. The latest sender wins.
    pub fn learn(&self, src: IpAddr, peer: SocketAddr) {
        let key = src.to_canonical();
        match self.learned.insert(key, peer) {
            None => log::debug!("[tun] new route: {} -> {}", key, peer),
            Some(old) if old != peer => {
                log::debug!("[tun] update route: {} -> {} (old {})", key, peer, old)
            }
            Some(_) => {}
        }
    }

    /// Peer that should receive packets for `dst`.
    ///
    /// A learned route for `dst` wins; otherwise the first static route whose
    /// network contains `dst` and whose gateway has a learned peer is used.
    pub fn find_route_for(&self, dst: IpAddr) -> Option<SocketAddr> {
        let dst = dst.to_canonical();
        if let Some(peer) = self.learned.get(&dst) {
            return Some(*peer);
        }
        self.static_routes
            .iter()
            .filter(|route| route.dest.contains(&dst))
            .filter_map(|route| route.gateway)
            .find_map(|gw| self.learned.get(&gw.to_canonical()).map(|peer| *peer))
    }

    pub fn len(&self) -> usize {
        self.learned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.learned.is_empty()
    }
}

// ============================================================================
// Handler
// ============================================================================

/// TUN halves shared across reconnects.
#[derive(Clone)]
struct TunIo {
    reader: Arc<Mutex<Box<dyn TunRead>>>,
    writer: Arc<Mutex<Box<dyn TunWrite>>>,
}

/// Routes packets between a TUN device and UDP peers.
pub struct TunHandler {
    chain: Chain,
    node: Node,
    table: Arc<RouteTable>,
    /// Cancelled on TUN read/write failure; the handler then stops for good.
    exit: CancellationToken,
}

impl TunHandler {
    pub fn new(options: HandlerOptions) -> Self {
        Self {
            chain: options.chain,
            node: options.node,
            table: Arc::new(RouteTable::new(options.ip_routes)),
            exit: CancellationToken::new(),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.table
    }

    /// Drive the TUN until `token` is cancelled or the device fails.
    ///
    /// Datagram connections that drop are re-established with backoff.
    pub async fn run(&self, token: CancellationToken, conn: TunConn) -> VpnResult<()> {
        let TunConn {
            name,
            reader,
            writer,
            routes,
        } = conn;
        let _routes = routes;
        let io = TunIo {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
        };

        let raddr = match self.node.remote.as_str() {
            "" => None,
            remote => Some(resolve_udp_addr(remote).await?),
        };

        let mut attempt = 0u32;
        while !token.is_cancelled() {
            let result = match self.establish(raddr).await {
                Ok(pc) => self.transport_tun(&token, &io, pc, raddr).await,
                Err(e) => Err(e),
            };

            let err = match result {
                Ok(()) => continue,
                Err(e) => e,
            };
            if self.exit.is_cancelled() {
                log::error!("[tun] {} failed: {}", name, err);
                return Err(err);
            }
            if token.is_cancelled() {
                break;
            }
            if !err.is_recoverable() {
                log::error!("[tun] {}: {} (not retrying)", name, err);
                return Err(err);
            }

            attempt = if matches!(err, VpnError::ConnectionLost(_)) {
                1
            } else {
                attempt.saturating_add(1)
            };
            let delay = reconnect_delay(attempt, &mut rand::rng());
            log::warn!(
                "[tun] {}: {}, retrying in {:.1}s",
                name,
                err,
                delay.as_secs_f64()
            );
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        log::debug!("[tun] {} stopped", name);
        Ok(())
    }

    /// Dial the remote through the chain, or bind the node's UDP address.
    async fn establish(&self, raddr: Option<SocketAddr>) -> VpnResult<Arc<dyn PacketConn>> {
        if let Some(raddr) = raddr {
            if !self.chain.is_empty() {
                let conn = self.chain.dial("udp", &raddr.to_string()).await?;
                log::debug!("[tun] dialed {} via chain", raddr);
                return conn.into_packet();
            }
        }
        let socket = UdpSocket::bind(self.node.bind_addr()).await?;
        log::debug!(
            "[tun] bound udp {}",
            socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default()
        );
        Ok(Arc::new(socket))
    }

    /// Run both forwarding directions until either ends or `token` fires.
    async fn transport_tun(
        &self,
        token: &CancellationToken,
        io: &TunIo,
        pc: Arc<dyn PacketConn>,
        raddr: Option<SocketAddr>,
    ) -> VpnResult<()> {
        let mut tasks = JoinSet::new();
        tasks.spawn(tun_to_net(
            io.reader.clone(),
            pc.clone(),
            raddr,
            self.table.clone(),
            self.exit.clone(),
        ));
        tasks.spawn(net_to_tun(
            io.writer.clone(),
            pc,
            raddr,
            self.table.clone(),
            self.exit.clone(),
        ));

        let result = tokio::select! {
            _ = token.cancelled() => Ok(()),
            Some(joined) = tasks.join_next() => match joined {
                Ok(r) => r,
                Err(e) => Err(VpnError::ConnectionLost(format!("forwarding task failed: {}", e))),
            },
        };
        tasks.shutdown().await;

        result.map_err(|e| {
            if self.exit.is_cancelled() || matches!(e, VpnError::ConnectionLost(_)) {
                e
            } else {
                VpnError::ConnectionLost(e.to_string())
            }
        })
    }
}

#[async_trait]
impl Handler for TunHandler {
    async fn handle(&self, token: CancellationToken, conn: Accepted) -> VpnResult<()> {
        match conn {
            Accepted::Tun(tun) => self.run(token, tun).await,
            other => Err(VpnError::Unsupported(format!("{:?} on tun handler", other))),
        }
    }
}

// ============================================================================
// Forwarding Loops
// ============================================================================

/// TUN -> network. Client mode sends everything to the remote; server mode
/// sends to the learned owner of the destination and drops the rest.
async fn tun_to_net(
    reader: Arc<Mutex<Box<dyn TunRead>>>,
    pc: Arc<dyn PacketConn>,
    raddr: Option<SocketAddr>,
    table: Arc<RouteTable>,
    exit: CancellationToken,
) -> VpnResult<()> {
    let mut reader = reader.lock().await;
    let pool = BufferPool::global();
    loop {
        let mut buf = pool.get();
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                exit.cancel();
                return Err(e);
            }
        };
        let packet = &buf[..n];
        let header = match parse_header(packet) {
            Ok(h) => h,
            Err(e) => {
                log::debug!("[tun] skip packet from device: {}", e);
                continue;
            }
        };

        if let Some(raddr) = raddr {
            pc.send_to(packet, raddr).await?;
            continue;
        }
        match table.find_route_for(header.dst) {
            Some(peer) => {
                log::trace!("[tun] {} >>> {} via {}", header.src, header.dst, peer);
                pc.send_to(packet, peer).await?;
            }
            None => log::debug!("[tun] no route for {} -> {}", header.src, header.dst),
        }
    }
}

/// Network -> TUN. Server mode learns the sender of each source address and
/// relays packets addressed to another peer instead of writing them locally.
async fn net_to_tun(
    writer: Arc<Mutex<Box<dyn TunWrite>>>,
    pc: Arc<dyn PacketConn>,
    raddr: Option<SocketAddr>,
    table: Arc<RouteTable>,
    exit: CancellationToken,
) -> VpnResult<()> {
    let mut writer = writer.lock().await;
    let pool = BufferPool::global();
    loop {
        let mut buf = pool.get();
        let (n, from) = pc.recv_from(&mut buf).await?;
        let packet = &buf[..n];
        let header = match parse_header(packet) {
            Ok(h) => h,
            Err(e) => {
                log::debug!("[tun] skip packet from {}: {}", from, e);
                continue;
            }
        };

        if raddr.is_none() {
            table.learn(header.src, from);
            if let Some(peer) = table.find_route_for(header.dst) {
                log::trace!("[tun] {} >>> {} relay to {}", header.src, header.dst, peer);
                pc.send_to(packet, peer).await?;
                continue;
            }
        }

        if let Err(e) = writer.write(packet).await {
            exit.cancel();
            return Err(e);
        }
    }
}
