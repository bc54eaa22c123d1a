//! Accept loops.

use crate::error::{VpnError, VpnResult};
use crate::proxy::handler::{Accepted, Handler};
use crate::proxy::tls;
use crate::tun::TunListener;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Upper bound on the pause after a failed accept.
const MAX_ACCEPT_DELAY: Duration = Duration::from_secs(1);

/// Source of accepted connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next connection. `None` once the listener is closed.
    async fn accept(&self) -> Option<VpnResult<Accepted>>;

    /// Human-readable listen address.
    fn addr(&self) -> String;

    fn close(&self);
}

// ============================================================================
// TCP + TLS
// ============================================================================

/// TCP listener whose connections are upgraded to TLS with the embedded pair.
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    acceptor: Option<TlsAcceptor>,
    closed: CancellationToken,
}

impl TcpListener {
    /// Bind `addr` (an empty host means all interfaces) with TLS.
    pub async fn bind(addr: &str) -> VpnResult<Self> {
        let listener = Self::bind_plain(addr).await?;
        Ok(Self {
            acceptor: Some(tls::acceptor()?),
            ..listener
        })
    }

    /// Bind without TLS.
    pub async fn bind_plain(addr: &str) -> VpnResult<Self> {
        let addr = if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        };
        let inner = tokio::net::TcpListener::bind(&addr).await?;
        log::info!("[tcp] listening on {}", inner.local_addr()?);
        Ok(Self {
            inner,
            acceptor: None,
            closed: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> VpnResult<std::net::SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Option<VpnResult<Accepted>> {
        let (tcp, peer) = tokio::select! {
            _ = self.closed.cancelled() => return None,
            accepted = self.inner.accept() => match accepted {
                Ok(a) => a,
                Err(e) => return Some(Err(e.into())),
            },
        };
        if let Err(e) = tcp.set_nodelay(true) {
            log::debug!("[tcp] set_nodelay for {}: {}", peer, e);
        }
        Some(Ok(match &self.acceptor {
            Some(acceptor) => Accepted::Tls {
                tcp,
                acceptor: acceptor.clone(),
                peer,
            },
            None => Accepted::Stream {
                stream: Box::new(tcp),
                peer,
            },
        }))
    }

    fn addr(&self) -> String {
        self.inner
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

// ============================================================================
// TUN
// ============================================================================

#[async_trait]
impl Listener for TunListener {
    async fn accept(&self) -> Option<VpnResult<Accepted>> {
        TunListener::accept(self).await.map(|conn| Ok(Accepted::Tun(conn)))
    }

    fn addr(&self) -> String {
        self.name().to_string()
    }

    fn close(&self) {
        TunListener::close(self);
    }
}

// ============================================================================
// Server
// ============================================================================

/// Pairs a listener with the handler for its connections.
pub struct Server {
    listener: Arc<dyn Listener>,
    handler: Arc<dyn Handler>,
}

impl Server {
    pub fn new(listener: Arc<dyn Listener>, handler: Arc<dyn Handler>) -> Self {
        Self { listener, handler }
    }

    pub fn addr(&self) -> String {
        self.listener.addr()
    }

    /// Accept until `token` is cancelled, handling each connection on its own
    /// task. Failed accepts are retried with a growing pause. A TUN device
    /// failure in any handler stops the server with that error.
    pub async fn serve(&self, token: CancellationToken) -> VpnResult<()> {
        let mut conns: JoinSet<VpnResult<()>> = JoinSet::new();
        let mut delay = Duration::ZERO;
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                Some(joined) = conns.join_next() => {
                    if let Ok(Err(e @ VpnError::TunDevice(_))) = joined {
                        self.listener.close();
                        return Err(e);
                    }
                    continue;
                }
                accepted = self.listener.accept() => accepted,
            };
            let conn = match accepted {
                None => break,
                Some(Ok(conn)) => conn,
                Some(Err(e)) => {
                    delay = if delay.is_zero() {
                        Duration::from_millis(5)
                    } else {
                        (delay * 2).min(MAX_ACCEPT_DELAY)
                    };
                    log::warn!(
                        "[server] accept on {}: {}; retrying in {:?}",
                        self.listener.addr(),
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            delay = Duration::ZERO;

            let handler = self.handler.clone();
            let conn_token = token.child_token();
            conns.spawn(async move {
                let description = format!("{:?}", conn);
                let result = match conn.establish().await {
                    Ok(conn) => handler.handle(conn_token, conn).await,
                    Err(e) => Err(e),
                };
                if let Err(ref e) = result {
                    log::debug!("[server] {} ended: {}", description, e);
                }
                result
            });
        }
        self.listener.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::chain::Chain;
    use crate::proxy::handler::HandlerOptions;
    use crate::proxy::node::Node;
    use crate::proxy::tcp_handler::TcpHandler;
    use crate::proxy::transport::{Client, Connector, TcpTransporter, Transporter, UdpOverTcpConnector};
    use tokio::net::UdpSocket;

    async fn udp_over_tls_server() -> (std::net::SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let node = Node::parse(&format!("tcp://{}", addr)).unwrap();
        let handler = TcpHandler::new(HandlerOptions::new(Chain::default(), node, vec![]));
        let server = Server::new(Arc::new(listener), Arc::new(handler));
        let token = CancellationToken::new();
        let serve_token = token.clone();
        tokio::spawn(async move { server.serve(serve_token).await });
        (addr, token)
    }

    #[tokio::test]
    async fn test_udp_over_tls_end_to_end() {
        let (addr, token) = udp_over_tls_server().await;
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();

        let connector: Arc<dyn Connector> = Arc::new(UdpOverTcpConnector);
        let transporter: Arc<dyn Transporter> = Arc::new(TcpTransporter::new().unwrap());
        let client = Client::new(connector, transporter);
        let pc = client
            .dial_and_connect(&addr.to_string(), "udp", &echo_addr.to_string())
            .await
            .unwrap()
            .into_packet()
            .unwrap();

        pc.send_to(b"over tls", echo_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, relay) = tokio::time::timeout(Duration::from_secs(5), echo.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"over tls");

        echo.send_to(b"reply", relay).await.unwrap();
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), pc.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"reply");
        assert_eq!(from, echo_addr);

        token.cancel();
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let listener = TcpListener::bind_plain("127.0.0.1:0").await.unwrap();
        let node = Node::parse("tcp://127.0.0.1:0").unwrap();
        let handler = TcpHandler::new(HandlerOptions::new(Chain::default(), node, vec![]));
        let server = Server::new(Arc::new(listener), Arc::new(handler));
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), server.serve(token))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_tun_failure_stops_server() {
        use crate::proxy::tun_handler::TunHandler;
        use crate::tun::{TunConfig, TunConn, TunRead, TunWrite};

        struct Broken;
        #[async_trait]
        impl TunRead for Broken {
            async fn read(&mut self, _buf: &mut [u8]) -> VpnResult<usize> {
                Err(VpnError::tun_device("read failed"))
            }
        }
        #[async_trait]
        impl TunWrite for Broken {
            async fn write(&mut self, _packet: &[u8]) -> VpnResult<()> {
                Err(VpnError::tun_device("write failed"))
            }
        }

        let conn = TunConn {
            name: "tun7".into(),
            reader: Box::new(Broken),
            writer: Box::new(Broken),
            routes: None,
        };
        let listener = TunListener::from_conn(
            TunConfig::new("223.254.254.2/24".parse().unwrap()),
            conn,
        );
        let node = Node::parse("tun://127.0.0.1:0").unwrap();
        let handler = TunHandler::new(HandlerOptions::new(Chain::default(), node, vec![]));
        let server = Server::new(Arc::new(listener), Arc::new(handler));
        let err = tokio::time::timeout(Duration::from_secs(2), server.serve(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, VpnError::TunDevice(_)));
    }
}
