//! Transporters and connectors: how to reach the next hop.
//!
//! A [`Transporter`] produces a byte stream to a node (TCP upgraded to TLS).
//! A [`Connector`] turns that stream into the connection the caller asked
//! for; the UDP-over-TCP connector wraps it in a [`FakeUdpTunnelConn`] so
//! packet-oriented code can run over a reliable stream.

use crate::error::{VpnError, VpnResult};
use crate::proxy::packet_conn::{FakeUdpTunnelConn, PacketConn};
use crate::proxy::tls;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Default TCP dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Object-safe async byte stream.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased stream produced by transporters.
pub type IoStream = Box<dyn AsyncReadWrite + 'static>;

/// Connection handed back by a connector.
pub enum Conn {
    /// Plain byte stream.
    Stream(IoStream),
    /// Datagram-oriented connection.
    Packet(Arc<dyn PacketConn>),
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conn::Stream(_) => f.write_str("Conn::Stream"),
            Conn::Packet(_) => f.write_str("Conn::Packet"),
        }
    }
}

impl Conn {
    /// Unwrap a packet connection.
    pub fn into_packet(self) -> VpnResult<Arc<dyn PacketConn>> {
        match self {
            Conn::Packet(pc) => Ok(pc),
            Conn::Stream(_) => Err(VpnError::Protocol("not a packet connection".into())),
        }
    }
}

/// Establishes the raw stream to a node.
#[async_trait]
pub trait Transporter: Send + Sync {
    async fn dial(&self, addr: &str) -> VpnResult<IoStream>;
}

/// Upgrades an established stream into the requested kind of connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, conn: IoStream, network: &str, address: &str) -> VpnResult<Conn>;
}

/// Connector/transporter pair attached to a node.
#[derive(Clone)]
pub struct Client {
    pub connector: Arc<dyn Connector>,
    pub transporter: Arc<dyn Transporter>,
}

impl Client {
    pub fn new(connector: Arc<dyn Connector>, transporter: Arc<dyn Transporter>) -> Self {
        Self {
            connector,
            transporter,
        }
    }

    /// The pair used by the tunnel: TLS over TCP carrying framed UDP.
    pub fn udp_over_tls() -> VpnResult<Self> {
        Ok(Self::new(
            Arc::new(UdpOverTcpConnector),
            Arc::new(TcpTransporter::new()?),
        ))
    }

    /// Dial `node_addr` and connect to `address` over it.
    pub async fn dial_and_connect(
        &self,
        node_addr: &str,
        network: &str,
        address: &str,
    ) -> VpnResult<Conn> {
        let stream = self.transporter.dial(node_addr).await?;
        self.connector.connect(stream, network, address).await
    }
}

/// TCP dialer with a fixed timeout, upgraded to TLS with the embedded pair.
pub struct TcpTransporter {
    timeout: Duration,
    tls: Option<TlsConnector>,
}

impl TcpTransporter {
    /// TLS-enabled transporter with the default timeout.
    pub fn new() -> VpnResult<Self> {
        Ok(Self {
            timeout: DIAL_TIMEOUT,
            tls: Some(tls::connector()?),
        })
    }

    /// Plain TCP transporter (no TLS).
    pub fn plain() -> Self {
        Self {
            timeout: DIAL_TIMEOUT,
            tls: None,
        }
    }

    /// Override the dial timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Transporter for TcpTransporter {
    async fn dial(&self, addr: &str) -> VpnResult<IoStream> {
        let tcp = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| VpnError::Timeout(format!("dial {} after {:?}", addr, self.timeout)))??;
        tcp.set_nodelay(true)?;

        let Some(connector) = &self.tls else {
            return Ok(Box::new(tcp));
        };
        let tls = tokio::time::timeout(self.timeout, connector.connect(tls::server_name()?, tcp))
            .await
            .map_err(|_| VpnError::Timeout(format!("TLS handshake with {}", addr)))?
            .map_err(|e| VpnError::tls_with_source(format!("TLS handshake with {} failed", addr), e))?;
        Ok(Box::new(tls))
    }
}

/// Wraps a stream so UDP datagrams travel as framed packets.
///
/// Stream networks (`tcp`, `tcp4`, `tcp6`) are rejected.
pub struct UdpOverTcpConnector;

#[async_trait]
impl Connector for UdpOverTcpConnector {
    async fn connect(&self, conn: IoStream, network: &str, address: &str) -> VpnResult<Conn> {
        if matches!(network, "tcp" | "tcp4" | "tcp6") {
            return Err(VpnError::Unsupported(network.to_string()));
        }
        Ok(Conn::Packet(Arc::new(FakeUdpTunnelConn::new(conn, address))))
    }
}
