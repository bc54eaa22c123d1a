//! Dial paths.
//!
//! A chain is an ordered list of hops with a retry budget. Only a single hop
//! is used in practice, so the chain holds at most one node.

use crate::error::{VpnError, VpnResult};
use crate::proxy::node::Node;
use crate::proxy::transport::Conn;

/// Retryable dial path through one node.
#[derive(Debug, Clone, Default)]
pub struct Chain {
    retries: usize,
    node: Option<Node>,
}

impl Chain {
    pub fn new(retries: usize, node: Option<Node>) -> Self {
        Self { retries, node }
    }

    /// True when no node is configured.
    pub fn is_empty(&self) -> bool {
        self.node.is_none()
    }

    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    /// Number of dial attempts a call to [`Chain::dial`] makes at most.
    pub fn attempts(&self) -> usize {
        self.retries.max(1)
    }

    /// Dial `address` through the chain's node.
    ///
    /// `address` is resolved first when non-empty; a failed lookup keeps the
    /// original string. Attempts are made back to back with no delay and the
    /// first success wins; the last error is returned when all fail.
    pub async fn dial(&self, network: &str, address: &str) -> VpnResult<Conn> {
        let node = self.node.as_ref().ok_or(VpnError::EmptyChain)?;
        let address = resolve_best_effort(address).await;

        let mut last_err = VpnError::EmptyChain;
        for attempt in 1..=self.attempts() {
            match dial_through(node, network, &address).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    log::debug!(
                        "[chain] dial {} via {} failed (attempt {}/{}): {}",
                        address,
                        node.addr,
                        attempt,
                        self.attempts(),
                        e
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

async fn dial_through(node: &Node, network: &str, address: &str) -> VpnResult<Conn> {
    let client = node
        .client
        .as_ref()
        .ok_or_else(|| VpnError::config(format!("node {} has no client", node)))?;
    client.dial_and_connect(&node.addr, network, address).await
}

async fn resolve_best_effort(address: &str) -> String {
    if address.is_empty() {
        return String::new();
    }
    match tokio::net::lookup_host(address).await {
        Ok(mut addrs) => addrs
            .next()
            .map(|a| a.to_string())
            .unwrap_or_else(|| address.to_string()),
        Err(e) => {
            log::debug!("[chain] resolve {}: {}", address, e);
            address.to_string()
        }
    }
}
