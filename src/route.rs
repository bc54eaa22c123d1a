//! Builds listeners and handlers from `-L` serve nodes and a `-F` chain node.

use crate::error::{VpnError, VpnResult};
use crate::proxy::chain::Chain;
use crate::proxy::handler::{Handler, HandlerOptions};
use crate::proxy::node::Node;
use crate::proxy::server::{Listener, Server, TcpListener};
use crate::proxy::tcp_handler::TcpHandler;
use crate::proxy::transport::Client;
use crate::proxy::tun_handler::TunHandler;
use crate::tun::{parse_ip_routes, IpRoute, TunConfig, TunListener};
use ipnet::Ipv4Net;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Serve nodes, an optional forward node, and the chain retry budget.
#[derive(Debug, Clone, Default)]
pub struct Route {
    /// `-L` nodes, one router each.
    pub serve_nodes: Vec<String>,
    /// `-F` node every router dials through. Empty for none.
    pub chain_node: String,
    pub retries: usize,
}

/// A listener paired with its handler.
pub struct Router {
    pub node: Node,
    pub server: Server,
}

impl Router {
    pub async fn serve(&self, token: CancellationToken) -> VpnResult<()> {
        log::debug!("{} on {}", self.node.protocol, self.server.addr());
        self.server.serve(token).await
    }
}

impl Route {
    pub fn new(serve_nodes: Vec<String>, chain_node: impl Into<String>, retries: usize) -> Self {
        Self {
            serve_nodes,
            chain_node: chain_node.into(),
            retries,
        }
    }

    /// The chain built from `chain_node`. A missing or unparsable node gives
    /// an empty chain.
    pub fn parse_chain(&self) -> VpnResult<Chain> {
        match parse_chain_node(&self.chain_node) {
            Ok(node) => Ok(Chain::new(self.retries, Some(node))),
            Err(VpnError::InvalidNode(raw)) => {
                if !raw.is_empty() {
                    log::warn!("ignoring invalid chain node {:?}", raw);
                }
                Ok(Chain::new(self.retries, None))
            }
            Err(e) => Err(e),
        }
    }

    /// Create a listener and handler for every serve node.
    pub async fn gen_routers(&self) -> VpnResult<Vec<Router>> {
        let chain = self.parse_chain()?;

        let mut routers = Vec::with_capacity(self.serve_nodes.len());
        for serve_node in &self.serve_nodes {
            let node = Node::parse(serve_node)?;
            let routes = node_routes(&node)?;

            let listener: Arc<dyn Listener> = match node.transport.as_str() {
                "tun" => Arc::new(TunListener::create(tun_config(&node, &routes)?).await?),
                _ => Arc::new(TcpListener::bind(&node.addr).await?),
            };

            let options = HandlerOptions::new(chain.clone(), node.clone(), routes);
            let handler: Arc<dyn Handler> = match node.protocol.as_str() {
                "tun" => Arc::new(TunHandler::new(options)),
                _ => Arc::new(TcpHandler::new(options)),
            };

            routers.push(Router {
                node,
                server: Server::new(listener, handler),
            });
        }
        Ok(routers)
    }
}

fn parse_chain_node(s: &str) -> VpnResult<Node> {
    Ok(Node::parse(s)?.with_client(Client::udp_over_tls()?))
}

/// `route=` CIDRs with `gw=` filled in as the default gateway.
fn node_routes(node: &Node) -> VpnResult<Vec<IpRoute>> {
    let gw = parse_gateway(node.get("gw"))?;
    Ok(parse_ip_routes(node.get("route"))
        .into_iter()
        .map(|r| IpRoute {
            dest: r.dest,
            gateway: r.gateway.or(gw),
        })
        .collect())
}

fn parse_gateway(gw: &str) -> VpnResult<Option<IpAddr>> {
    if gw.is_empty() {
        return Ok(None);
    }
    gw.parse()
        .map(Some)
        .map_err(|e| VpnError::config_with_source(format!("invalid gateway {:?}", gw), e))
}

fn tun_config(node: &Node, routes: &[IpRoute]) -> VpnResult<TunConfig> {
    let net = node.get("net");
    let address: Ipv4Net = net
        .parse()
        .map_err(|e| VpnError::config_with_source(format!("invalid tun net {:?}", net), e))?;
    let mtu = u16::try_from(node.get_int("mtu")).unwrap_or(0);
    Ok(TunConfig::new(address)
        .with_name(node.get("name"))
        .with_mtu(mtu)
        .with_routes(routes.to_vec())
        .with_gateway(parse_gateway(node.get("gw"))?))
}

/// Start every router on its own task.
///
/// Returns a channel that yields the error of any router that stops with
/// one. Fails up front when no router could be built.
pub async fn start(
    token: CancellationToken,
    route: &Route,
) -> VpnResult<mpsc::UnboundedReceiver<VpnError>> {
    let routers = route.gen_routers().await?;
    if routers.is_empty() {
        return Err(VpnError::config("invalid config: no serve nodes"));
    }

    let (err_tx, err_rx) = mpsc::unbounded_channel();
    for router in routers {
        let token = token.clone();
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = router.serve(token).await {
                log::debug!("{} router stopped: {}", router.node, e);
                let _ = err_tx.send(e);
            }
        });
    }
    Ok(err_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_chain_node_errors_leave_empty_chain() {
        let route = Route::new(vec![], "", 3);
        assert!(route.parse_chain().unwrap().is_empty());

        let route = Route::new(vec![], "ftp://nowhere", 3);
        assert!(route.parse_chain().unwrap().is_empty());

        let route = Route::new(vec![], "tcp://127.0.0.1:10800", 5);
        let chain = route.parse_chain().unwrap();
        assert!(!chain.is_empty());
        assert_eq!(chain.attempts(), 5);
        assert!(chain.node().unwrap().client.is_some());
    }

    #[test]
    fn test_node_routes_default_gateway() {
        let node =
            Node::parse("tun://:8421?net=223.254.254.2/24&route=10.0.0.0/16,10.1.0.0/24&gw=223.254.254.100")
                .unwrap();
        let routes = node_routes(&node).unwrap();
        assert_eq!(routes.len(), 2);
        let gw: IpAddr = "223.254.254.100".parse().unwrap();
        assert!(routes.iter().all(|r| r.gateway == Some(gw)));

        let bad = Node::parse("tun://:8421?gw=not-an-ip").unwrap();
        assert!(node_routes(&bad).is_err());
    }

    #[test]
    fn test_tun_config_from_node() {
        let node = Node::parse(
            "tun://:8421/127.0.0.1:8421?net=223.254.254.2/24&route=223.254.254.100/24,10.0.0.0/16&mtu=1400&name=utun9",
        )
        .unwrap();
        let routes = node_routes(&node).unwrap();
        let config = tun_config(&node, &routes).unwrap();
        assert_eq!(config.address.to_string(), "223.254.254.2/24");
        assert_eq!(config.mtu, 1400);
        assert_eq!(config.name.as_deref(), Some("utun9"));
        assert_eq!(config.routes.len(), 2);

        let missing = Node::parse("tun://:8421").unwrap();
        assert!(tun_config(&missing, &[]).is_err());
    }

    #[tokio::test]
    async fn test_start_requires_serve_nodes() {
        let err = start(CancellationToken::new(), &Route::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid config"));
    }

    #[tokio::test]
    async fn test_start_tcp_router() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let token = CancellationToken::new();
        let route = Route::new(vec![format!("tcp://{}", addr)], "", 0);
        let _errors = start(token.clone(), &route).await.unwrap();

        let stream = tokio::time::timeout(
            Duration::from_secs(2),
            tokio::net::TcpStream::connect(addr),
        )
        .await
        .unwrap();
        assert!(stream.is_ok());
        token.cancel();
    }
}
