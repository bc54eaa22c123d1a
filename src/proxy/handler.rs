//! Connection handlers.
//!
//! A listener produces [`Accepted`] connections; a [`Handler`] owns each one
//! until it ends.

use crate::error::{VpnError, VpnResult};
use crate::proxy::chain::Chain;
use crate::proxy::node::Node;
use crate::proxy::transport::IoStream;
use crate::tun::{IpRoute, TunConn};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// TLS handshake deadline for accepted TCP connections.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Something a listener handed over.
pub enum Accepted {
    /// Established byte stream.
    Stream { stream: IoStream, peer: SocketAddr },
    /// TCP connection whose TLS handshake still has to run.
    Tls {
        tcp: TcpStream,
        acceptor: TlsAcceptor,
        peer: SocketAddr,
    },
    /// The TUN device.
    Tun(TunConn),
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accepted::Stream { peer, .. } => write!(f, "Stream({})", peer),
            Accepted::Tls { peer, .. } => write!(f, "Tls({})", peer),
            Accepted::Tun(conn) => write!(f, "Tun({})", conn.name),
        }
    }
}

impl Accepted {
    /// Finish any pending handshake. Runs on the connection's own task so a
    /// slow client never stalls the accept loop.
    pub async fn establish(self) -> VpnResult<Accepted> {
        match self {
            Accepted::Tls {
                tcp,
                acceptor,
                peer,
            } => {
                let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp))
                    .await
                    .map_err(|_| VpnError::Timeout(format!("TLS handshake from {}", peer)))?
                    .map_err(|e| {
                        VpnError::tls_with_source(format!("TLS handshake from {} failed", peer), e)
                    })?;
                Ok(Accepted::Stream {
                    stream: Box::new(tls),
                    peer,
                })
            }
            other => Ok(other),
        }
    }
}

/// Options shared by handlers.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub chain: Chain,
    /// The serve node this handler was built for.
    pub node: Node,
    /// Static routes seeded into the TUN router.
    pub ip_routes: Vec<IpRoute>,
}

impl HandlerOptions {
    pub fn new(chain: Chain, node: Node, ip_routes: Vec<IpRoute>) -> Self {
        Self {
            chain,
            node,
            ip_routes,
        }
    }
}

/// Owns an accepted connection until it ends.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, token: CancellationToken, conn: Accepted) -> VpnResult<()>;
}
