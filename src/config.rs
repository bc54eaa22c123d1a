//! Configuration file support for kubetun.
//!
//! Every setting is optional; command-line flags override the file and the
//! file overrides the built-in defaults.
//! - [cluster] kubeconfig and namespace
//! - [tunnel] router image, ports, retries and timeouts
//! - [dns] local DNS forwarder

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_IMAGE: &str = "ghcr.io/kubetun/kubetun:latest";
/// Router pod port carrying UDP-over-TLS, forwarded to localhost.
pub const DEFAULT_CONTROL_PORT: u16 = 10800;
/// UDP port of the TUN routers.
pub const DEFAULT_TUN_PORT: u16 = 8421;
pub const DEFAULT_RETRIES: usize = 5;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 15;
pub const DEFAULT_PORT_FORWARD_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_POD_READY_TIMEOUT_SECS: u64 = 300;

// ============================================================================
// Sections
// ============================================================================

#[derive(Deserialize, Default, Clone, Debug)]
pub struct ClusterConfig {
    pub kubeconfig: Option<PathBuf>,
    pub namespace: Option<String>,
}

#[derive(Deserialize, Default, Clone, Debug)]
pub struct TunnelConfig {
    pub image: Option<String>,
    pub control_port: Option<u16>,
    pub tun_port: Option<u16>,
    pub retries: Option<usize>,
    pub mtu: Option<u16>,
    pub heartbeat_secs: Option<u64>,
    pub port_forward_timeout_secs: Option<u64>,
    pub pod_ready_timeout_secs: Option<u64>,
    /// Lease the TUN address at random instead of from the MAC address.
    pub random_lease: Option<bool>,
}

#[derive(Deserialize, Default, Clone, Debug)]
pub struct DnsConfig {
    pub enabled: Option<bool>,
    /// Forwarder address; defaults to port 53 on the TUN address.
    pub listen: Option<SocketAddr>,
}

/// Whole configuration file.
#[derive(Deserialize, Default, Clone, Debug)]
pub struct Config {
    pub cluster: Option<ClusterConfig>,
    pub tunnel: Option<TunnelConfig>,
    pub dns: Option<DnsConfig>,
}

// ============================================================================
// Config Accessor Methods
// ============================================================================

impl Config {
    /// Get cluster config, with defaults.
    pub fn cluster(&self) -> ClusterConfig {
        self.cluster.clone().unwrap_or_default()
    }

    /// Get tunnel config, with defaults.
    pub fn tunnel(&self) -> TunnelConfig {
        self.tunnel.clone().unwrap_or_default()
    }

    /// Get DNS config, with defaults.
    pub fn dns(&self) -> DnsConfig {
        self.dns.clone().unwrap_or_default()
    }
}

impl TunnelConfig {
    pub fn image(&self) -> String {
        self.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string())
    }

    pub fn control_port(&self) -> u16 {
        self.control_port.unwrap_or(DEFAULT_CONTROL_PORT)
    }

    pub fn tun_port(&self) -> u16 {
        self.tun_port.unwrap_or(DEFAULT_TUN_PORT)
    }

    pub fn retries(&self) -> usize {
        self.retries.unwrap_or(DEFAULT_RETRIES)
    }

    /// MTU for the TUN device; 0 keeps the device default.
    pub fn mtu(&self) -> u16 {
        self.mtu.unwrap_or(0)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS).max(1))
    }

    pub fn port_forward_timeout(&self) -> Duration {
        Duration::from_secs(
            self.port_forward_timeout_secs
                .unwrap_or(DEFAULT_PORT_FORWARD_TIMEOUT_SECS),
        )
    }

    pub fn pod_ready_timeout(&self) -> Duration {
        Duration::from_secs(
            self.pod_ready_timeout_secs
                .unwrap_or(DEFAULT_POD_READY_TIMEOUT_SECS),
        )
    }

    pub fn random_lease(&self) -> bool {
        self.random_lease.unwrap_or(false)
    }
}

impl DnsConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

// ============================================================================
// Config Loading
// ============================================================================

/// Load configuration from a TOML file.
fn load_config<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve the default config path (~/.config/kubetun/config.toml).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kubetun").join("config.toml"))
}

/// Load configuration from an explicit path, or from the default location.
///
/// - `path`: Some(path) must exist and parse
/// - `path`: None reads the default path when present, otherwise defaults
pub fn load_config_or_default(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => load_config(p),
        None => match default_config_path() {
            Some(p) if p.exists() => load_config(&p),
            _ => Ok(Config::default()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        let tunnel = config.tunnel();
        assert_eq!(tunnel.control_port(), DEFAULT_CONTROL_PORT);
        assert_eq!(tunnel.tun_port(), DEFAULT_TUN_PORT);
        assert_eq!(tunnel.retries(), 5);
        assert_eq!(tunnel.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(tunnel.port_forward_timeout(), Duration::from_secs(300));
        assert!(!tunnel.random_lease());
        assert!(config.dns().enabled());
        assert!(config.cluster().namespace.is_none());
    }

    #[test]
    fn test_load_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[cluster]
namespace = "dev"

[tunnel]
image = "registry.local/kubetun:1"
retries = 2
heartbeat_secs = 30

[dns]
enabled = false
listen = "127.0.0.1:5353"
"#
        )
        .unwrap();

        let config = load_config_or_default(Some(file.path())).unwrap();
        assert_eq!(config.cluster().namespace.as_deref(), Some("dev"));
        assert_eq!(config.tunnel().image(), "registry.local/kubetun:1");
        assert_eq!(config.tunnel().retries(), 2);
        assert_eq!(config.tunnel().heartbeat_interval(), Duration::from_secs(30));
        assert!(!config.dns().enabled());
        assert_eq!(config.dns().listen, Some("127.0.0.1:5353".parse().unwrap()));
    }

    #[test]
    fn test_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_or_default(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_parse_error_has_context() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tunnel]\nretries = \"many\"").unwrap();
        let err = load_config_or_default(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
