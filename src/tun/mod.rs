//! TUN interface plumbing: device creation, OS routes, and the TUN listener.
//!
//! The router in [`crate::proxy::tun_handler`] only sees the [`TunRead`] /
//! [`TunWrite`] halves of a [`TunConn`], so it can run against a real
//! device or an in-memory pair.

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
compile_error!("kubetun only supports Linux, macOS, and Windows");

pub mod device;
pub mod listener;

use crate::error::VpnResult;
use async_trait::async_trait;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

pub use device::{RouteGuard, TunConfig, TunDevice};
pub use listener::TunListener;

/// Environment variable carrying the created interface name to DNS setup.
pub const TUN_NAME_ENV: &str = "tunName";

/// Static route seeded into the TUN router: packets for `dest` go to the
/// peer learned for `gateway`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRoute {
    pub dest: IpNet,
    pub gateway: Option<IpAddr>,
}

impl IpRoute {
    pub fn new(dest: IpNet) -> Self {
        Self {
            dest,
            gateway: None,
        }
    }
}

impl fmt::Display for IpRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gateway {
            Some(gw) => write!(f, "{} via {}", self.dest, gw),
            None => write!(f, "{}", self.dest),
        }
    }
}

/// Parse a comma-separated CIDR list; unparsable entries are skipped.
pub fn parse_ip_routes(list: &str) -> Vec<IpRoute> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<IpNet>() {
            Ok(net) => Some(IpRoute::new(net.trunc())),
            Err(_) => {
                log::debug!("[tun] ignoring invalid route {:?}", s);
                None
            }
        })
        .collect()
}

/// Read half of a TUN interface.
#[async_trait]
pub trait TunRead: Send {
    /// Read one raw IP packet into `buf`.
    async fn read(&mut self, buf: &mut [u8]) -> VpnResult<usize>;
}

/// Write half of a TUN interface.
#[async_trait]
pub trait TunWrite: Send {
    /// Write one raw IP packet.
    async fn write(&mut self, packet: &[u8]) -> VpnResult<()>;
}

/// An accepted TUN "connection": the device halves plus anything that must
/// live as long as the device (installed routes).
pub struct TunConn {
    pub name: String,
    pub reader: Box<dyn TunRead>,
    pub writer: Box<dyn TunWrite>,
    pub routes: Option<RouteGuard>,
}

impl fmt::Debug for TunConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunConn").field("name", &self.name).finish()
    }
}
