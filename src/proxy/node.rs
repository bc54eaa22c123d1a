//! Node addresses: `scheme://[user:pass@]host:port[/remote][?key=value&...]`.
//!
//! A node names one hop of a proxy pipeline. The scheme selects the
//! protocol and transport (`tun` or `tcp`; `proto+transport` is also
//! accepted), the path carries the remote peer address, and the query string
//! carries options such as `net`, `route`, `gw`, `mtu` and `name`.

use crate::error::{VpnError, VpnResult};
use crate::proxy::transport::Client;
use std::collections::HashMap;
use std::fmt;

/// Schemes a node may use.
const SUPPORTED_SCHEMES: &[&str] = &["tun", "tcp"];

/// One parsed hop.
#[derive(Clone)]
pub struct Node {
    /// Listen or dial address, `host:port` (host may be empty).
    pub addr: String,
    /// Handler protocol (`tun` or `tcp`).
    pub protocol: String,
    /// Listener/dialer transport (`tun` or `tcp`).
    pub transport: String,
    /// Remote peer address taken from the path, without the leading slash.
    pub remote: String,
    /// Optional `user[:password]` credentials.
    pub user: Option<String>,
    values: HashMap<String, String>,
    /// Connector/transporter used when dialing through this node.
    pub client: Option<Client>,
    raw: String,
}

impl Node {
    /// Parse a node address.
    ///
    /// Fails with [`VpnError::InvalidNode`] for an unknown scheme or a
    /// string that is not URI-shaped.
    pub fn parse(s: &str) -> VpnResult<Self> {
        let s = s.trim();
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| VpnError::InvalidNode(s.to_string()))?;

        let scheme = scheme.to_ascii_lowercase();
        let (protocol, transport) = match scheme.split_once('+') {
            Some((p, t)) => (p.to_string(), t.to_string()),
            None => (scheme.clone(), scheme.clone()),
        };
        if !SUPPORTED_SCHEMES.contains(&protocol.as_str())
            || !SUPPORTED_SCHEMES.contains(&transport.as_str())
        {
            return Err(VpnError::InvalidNode(s.to_string()));
        }

        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, q),
            None => (rest, ""),
        };
        let (authority, remote) = match rest.split_once('/') {
            Some((a, p)) => (a, p),
            None => (rest, ""),
        };
        let (user, addr) = match authority.rsplit_once('@') {
            Some((u, a)) => (Some(u.to_string()), a),
            None => (None, authority),
        };

        let values = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();

        Ok(Self {
            addr: addr.to_string(),
            protocol,
            transport,
            remote: remote.trim_end_matches('/').to_string(),
            user,
            values,
            client: None,
            raw: s.to_string(),
        })
    }

    /// Option value, or an empty string when absent.
    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or("")
    }

    /// Integer option, or 0 when absent or malformed.
    pub fn get_int(&self, key: &str) -> i64 {
        self.get(key).trim().parse().unwrap_or(0)
    }

    /// Boolean option (`true`/`1`/`yes`).
    pub fn get_bool(&self, key: &str) -> bool {
        matches!(
            self.get(key).to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        )
    }

    /// `addr` with an empty host replaced by the wildcard address.
    pub fn bind_addr(&self) -> String {
        if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        }
    }

    /// Attach the connector/transporter pair used for dialing.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.addr)
            .field("protocol", &self.protocol)
            .field("transport", &self.transport)
            .field("remote", &self.remote)
            .field("values", &self.values)
            .field("client", &self.client.is_some())
            .finish()
    }
}
