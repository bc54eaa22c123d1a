//! Local listener bridged to the router pod through Kubernetes port-forward.

use crate::cluster::ClusterApi;
use crate::error::{VpnError, VpnResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const RETRY_DELAY: Duration = Duration::from_secs(1);
const FREE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Attempts to open a stream for one accepted connection.
const STREAM_ATTEMPTS: usize = 3;

/// Wait until nothing listens on `127.0.0.1:port`.
pub async fn wait_port_free(port: u16, timeout: Duration) -> VpnResult<()> {
    let poll = async {
        loop {
            match std::net::TcpListener::bind(("127.0.0.1", port)) {
                Ok(_) => return,
                Err(_) => tokio::time::sleep(FREE_POLL_INTERVAL).await,
            }
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| VpnError::Timeout(format!("port {} is still in use", port)))
}

/// Keeps `local` forwarded to `remote_port` of a pod.
pub struct PortForwarder {
    cluster: Arc<dyn ClusterApi>,
    pod: String,
    remote_port: u16,
}

impl PortForwarder {
    pub fn new(cluster: Arc<dyn ClusterApi>, pod: impl Into<String>, remote_port: u16) -> Self {
        Self {
            cluster,
            pod: pod.into(),
            remote_port,
        }
    }

    /// Bind `local`, wait until a stream to the pod can be opened, then
    /// forward connections in the background until `token` is cancelled.
    ///
    /// Fails at once when `local` is taken or the pod does not exist, and
    /// after `ready_timeout` when the pod never accepts a stream.
    pub async fn start(
        self,
        local: SocketAddr,
        token: CancellationToken,
        ready_timeout: Duration,
    ) -> VpnResult<SocketAddr> {
        let listener = TcpListener::bind(local).await.map_err(|e| {
            VpnError::config_with_source(format!("port-forward cannot listen on {}", local), e)
        })?;
        let bound = listener.local_addr()?;
        log::info!("port-forwarding {} -> {}:{}", bound, self.pod, self.remote_port);

        tokio::time::timeout(ready_timeout, self.wait_ready(&token))
            .await
            .map_err(|_| {
                VpnError::Timeout(format!(
                    "port-forward {} to {} not ready after {:?}",
                    bound, self.pod, ready_timeout
                ))
            })??;
        log::info!("port-forward {} ready", bound);

        let forwarder = Arc::new(self);
        tokio::spawn(async move { forwarder.accept_loop(listener, token).await });
        Ok(bound)
    }

    async fn wait_ready(&self, token: &CancellationToken) -> VpnResult<()> {
        loop {
            if token.is_cancelled() {
                return Err(VpnError::ConnectionLost("port-forward cancelled".into()));
            }
            match self.cluster.port_forward(&self.pod, self.remote_port).await {
                Ok(_probe) => return Ok(()),
                Err(e) if e.is_not_found() => return Err(e.into()),
                Err(e) => {
                    log::warn!("port-forward not ready: {}, retrying", e);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        loop {
            let (conn, peer) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        log::warn!("port-forward accept: {}, retrying", e);
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                },
            };
            let forwarder = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    result = forwarder.bridge(conn) => {
                        if let Err(e) = result {
                            log::debug!("port-forward {} ended: {}", peer, e);
                        }
                    }
                }
            });
        }
        log::debug!("port-forward to {} stopped", self.pod);
    }

    async fn bridge(&self, mut conn: TcpStream) -> VpnResult<()> {
        let mut attempt = 1;
        let mut upstream = loop {
            match self.cluster.port_forward(&self.pod, self.remote_port).await {
                Ok(stream) => break stream,
                Err(e) if attempt < STREAM_ATTEMPTS && !e.is_not_found() => {
                    log::warn!("port-forward stream: {}, retrying", e);
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::cluster::PodRecord;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn router(cluster: &InMemoryCluster) {
        cluster.insert_pod(PodRecord {
            name: "router".into(),
            phase: "Running".into(),
            ..Default::default()
        });
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_forwards_connections() {
        let cluster = Arc::new(InMemoryCluster::default());
        router(&cluster);
        cluster.set_forward_target(echo_server().await);

        let token = CancellationToken::new();
        let local = PortForwarder::new(cluster, "router", 10800)
            .start("127.0.0.1:0".parse().unwrap(), token.clone(), Duration::from_secs(5))
            .await
            .unwrap();

        let mut conn = TcpStream::connect(local).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");
        token.cancel();
    }

    #[tokio::test]
    async fn test_address_in_use_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let cluster = Arc::new(InMemoryCluster::default());
        router(&cluster);
        let err = PortForwarder::new(cluster, "router", 10800)
            .start(taken.local_addr().unwrap(), CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, VpnError::Config(_)));
    }

    #[tokio::test]
    async fn test_missing_pod_is_fatal() {
        let cluster = Arc::new(InMemoryCluster::default());
        let err = PortForwarder::new(cluster, "router", 10800)
            .start("127.0.0.1:0".parse().unwrap(), CancellationToken::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, VpnError::Cluster(_)));
    }

    #[tokio::test]
    async fn test_ready_timeout() {
        let cluster = Arc::new(InMemoryCluster::default());
        router(&cluster);
        // no forward target: every stream attempt fails
        let err = PortForwarder::new(cluster, "router", 10800)
            .start("127.0.0.1:0".parse().unwrap(), CancellationToken::new(), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, VpnError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_wait_port_free() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        assert!(wait_port_free(port, Duration::from_millis(200)).await.is_err());
        drop(taken);
        wait_port_free(port, Duration::from_secs(1)).await.unwrap();
    }
}
