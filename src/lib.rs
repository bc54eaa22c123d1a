//! kubetun library
//!
//! Layer-3 tunnel from a developer machine into a Kubernetes cluster's pod
//! and service networks, with workload traffic redirection.

pub mod cluster;
pub mod config;
pub mod connect;
pub mod dhcp;
pub mod dns;
pub mod error;
pub mod lock;
pub mod proxy;
pub mod reverse;
pub mod route;
pub mod route_conflict;
pub mod tun;

pub use error::{VpnError, VpnResult};
