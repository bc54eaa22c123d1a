//! TUN device creation and OS route management.

use crate::error::{VpnError, VpnResult};
use crate::tun::{IpRoute, TunRead, TunWrite};
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use std::net::IpAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tun::{AbstractDevice, AsyncDevice, Configuration, DeviceReader, DeviceWriter};

/// Default MTU for the tunnel interface.
pub const DEFAULT_MTU: u16 = 1350;

/// TUN device configuration.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Device name (e.g., "utun5"). If None, the system assigns one.
    pub name: Option<String>,
    /// Interface address with prefix, e.g. 223.254.254.2/24.
    pub address: Ipv4Net,
    pub mtu: u16,
    /// Routes installed through the interface once it is up.
    pub routes: Vec<IpRoute>,
    /// Default gateway applied to routes that carry none.
    pub gateway: Option<IpAddr>,
}

impl TunConfig {
    pub fn new(address: Ipv4Net) -> Self {
        Self {
            name: None,
            address,
            mtu: DEFAULT_MTU,
            routes: Vec::new(),
            gateway: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.name = (!name.is_empty()).then_some(name);
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        if mtu > 0 {
            self.mtu = mtu;
        }
        self
    }

    pub fn with_routes(mut self, routes: Vec<IpRoute>) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_gateway(mut self, gateway: Option<IpAddr>) -> Self {
        self.gateway = gateway;
        self
    }

    /// Routes with the default gateway filled in where missing.
    pub fn effective_routes(&self) -> Vec<IpRoute> {
        self.routes
            .iter()
            .map(|r| IpRoute {
                dest: r.dest,
                gateway: r.gateway.or(self.gateway),
            })
            .collect()
    }
}

/// A managed TUN device with async I/O.
pub struct TunDevice {
    device: AsyncDevice,
    name: String,
}

impl TunDevice {
    /// Create and bring up a TUN device.
    pub fn create(config: &TunConfig) -> VpnResult<Self> {
        let mut tun_config = Configuration::default();

        // Point-to-point peer is the interface address itself; everything
        // else reaches the device through explicit routes.
        tun_config
            .address(config.address.addr())
            .netmask(config.address.netmask())
            .destination(config.address.addr())
            .mtu(config.mtu)
            .up();

        if let Some(ref name) = config.name {
            #[allow(deprecated)]
            tun_config.name(name);
        }

        #[cfg(target_os = "linux")]
        tun_config.platform_config(|platform_config| {
            platform_config.ensure_root_privileges(true);
        });

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| VpnError::tun_device_with_source("Failed to create TUN device", e))?;

        let name = device
            .tun_name()
            .map_err(|e| VpnError::tun_device_with_source("Failed to get TUN name", e))?;

        log::info!("Created TUN device: {} with IP {}", name, config.address);

        Ok(Self { device, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Split the device into read and write halves.
    /// Note: The tun crate returns (writer, reader) order from split().
    pub fn split(self) -> VpnResult<(TunReader, TunWriter)> {
        let (writer, reader) = self
            .device
            .split()
            .map_err(|e| VpnError::tun_device_with_source("Failed to split TUN device", e))?;
        Ok((TunReader { reader }, TunWriter { writer }))
    }
}

/// Read half of a split TUN device.
pub struct TunReader {
    reader: DeviceReader,
}

#[async_trait]
impl TunRead for TunReader {
    async fn read(&mut self, buf: &mut [u8]) -> VpnResult<usize> {
        self.reader
            .read(buf)
            .await
            .map_err(|e| VpnError::tun_device_with_source("TUN read failed", e))
    }
}

/// Write half of a split TUN device.
pub struct TunWriter {
    writer: DeviceWriter,
}

#[async_trait]
impl TunWrite for TunWriter {
    async fn write(&mut self, packet: &[u8]) -> VpnResult<()> {
        self.writer
            .write_all(packet)
            .await
            .map_err(|e| VpnError::tun_device_with_source("TUN write failed", e))
    }
}

// ============================================================================
// OS Routes
// ============================================================================

/// Check if an error message indicates that a resource already exists.
///
/// Used for idempotent route operations. Handles:
/// - Linux iproute2: "RTNETLINK answers: File exists"
/// - macOS route: "route: writing to routing socket: File exists"
/// - Windows netsh: "The object already exists" or "Element already exists"
fn is_already_exists_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("file exists")
        || lower.contains("eexist")
        || lower.contains("object already exists")
        || lower.contains("element already exists")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteOp {
    Add,
    Delete,
}

/// Program and arguments that add or remove `net` through `tun_name`.
fn route_command(op: RouteOp, net: &IpNet, tun_name: &str) -> (&'static str, Vec<String>) {
    #[cfg(target_os = "macos")]
    {
        let verb = if op == RouteOp::Add { "add" } else { "delete" };
        let args = match net {
            IpNet::V4(v4) => vec![
                verb.into(),
                "-net".into(),
                v4.network().to_string(),
                "-netmask".into(),
                v4.netmask().to_string(),
                "-interface".into(),
                tun_name.into(),
            ],
            IpNet::V6(v6) => vec![
                verb.into(),
                "-inet6".into(),
                v6.to_string(),
                "-interface".into(),
                tun_name.into(),
            ],
        };
        ("route", args)
    }

    #[cfg(target_os = "linux")]
    {
        let verb = if op == RouteOp::Add { "add" } else { "del" };
        let mut args: Vec<String> = Vec::with_capacity(6);
        if matches!(net, IpNet::V6(_)) {
            args.push("-6".into());
        }
        args.extend([
            "route".into(),
            verb.into(),
            net.to_string(),
            "dev".into(),
            tun_name.into(),
        ]);
        ("ip", args)
    }

    #[cfg(target_os = "windows")]
    {
        let verb = if op == RouteOp::Add { "add" } else { "delete" };
        let family = if matches!(net, IpNet::V6(_)) { "ipv6" } else { "ipv4" };
        let mut args: Vec<String> = vec![
            "interface".into(),
            family.into(),
            verb.into(),
            "route".into(),
            format!("prefix={}", net),
            format!("interface={}", tun_name),
        ];
        if op == RouteOp::Add {
            args.push("store=active".into());
        }
        ("netsh", args)
    }
}

fn command_output_text(output: &std::process::Output) -> String {
    // netsh reports errors on stdout.
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    }
}

/// Result of adding one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAdded {
    Installed,
    /// The route was already there; it is not ours to remove.
    Existing,
}

fn add_outcome(net: &IpNet, success: bool, text: &str) -> VpnResult<RouteAdded> {
    if success {
        return Ok(RouteAdded::Installed);
    }
    if is_already_exists_error(text) {
        log::warn!("route {} already exists (treating as success): {}", net, text);
        Ok(RouteAdded::Existing)
    } else {
        Err(VpnError::tun_device(format!(
            "Failed to add route {}: {}",
            net, text
        )))
    }
}

/// Add a route through the TUN interface. An existing route counts as success.
pub async fn add_route(tun_name: &str, net: &IpNet) -> VpnResult<RouteAdded> {
    let (program, args) = route_command(RouteOp::Add, net, tun_name);
    let output = Command::new(program)
        .args(&args)
        .output()
        .await
        .map_err(|e| {
            VpnError::tun_device_with_source(format!("Failed to execute {} command", program), e)
        })?;

    if output.status.success() {
        log::info!("Added route {} via {}", net, tun_name);
    }
    add_outcome(net, output.status.success(), &command_output_text(&output))
}

/// Remove a route (blocking, best-effort; used from Drop).
fn remove_route_sync(tun_name: &str, net: &IpNet) {
    let (program, args) = route_command(RouteOp::Delete, net, tun_name);
    match std::process::Command::new(program).args(&args).output() {
        Ok(output) if output.status.success() => {
            log::info!("Removed route {} via {}", net, tun_name);
        }
        Ok(output) => {
            log::warn!(
                "Failed to remove route {}: {}",
                net,
                command_output_text(&output)
            );
        }
        Err(e) => log::warn!("Failed to execute {} route delete: {}", program, e),
    }
}

/// Add every route through the interface.
///
/// Returns a [`RouteGuard`] that removes the routes this call installed
/// when dropped. Routes that already existed are left alone. If any route
/// fails, the installed ones are removed before returning.
pub async fn add_routes(tun_name: &str, routes: &[IpNet]) -> VpnResult<RouteGuard> {
    let mut guard = RouteGuard::new(tun_name.to_string());
    for net in routes {
        match add_route(tun_name, net).await {
            Ok(added) => guard.record(*net, added),
            Err(e) => {
                log::warn!(
                    "Failed to add route {}, removing {} installed route(s)",
                    net,
                    guard.routes.len()
                );
                drop(guard);
                return Err(e);
            }
        }
    }
    Ok(guard)
}

/// Guard that removes installed routes when dropped.
pub struct RouteGuard {
    tun_name: String,
    routes: Vec<IpNet>,
}

impl RouteGuard {
    fn new(tun_name: String) -> Self {
        Self {
            tun_name,
            routes: Vec::new(),
        }
    }

    fn record(&mut self, net: IpNet, added: RouteAdded) {
        if added == RouteAdded::Installed {
            self.routes.push(net);
        }
    }

    /// Routes removed on drop.
    pub fn routes(&self) -> &[IpNet] {
        &self.routes
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        if self.routes.is_empty() {
            return;
        }
        log::info!(
            "Cleaning up {} route(s) via {}",
            self.routes.len(),
            self.tun_name
        );
        for net in self.routes.iter().rev() {
            remove_route_sync(&self.tun_name, net);
        }
    }
}

/// Destinations to install on the OS, skipping the interface's own subnet
/// (the kernel adds that one when the address is assigned).
pub fn os_route_destinations(address: Ipv4Net, routes: &[IpRoute]) -> Vec<IpNet> {
    let own = IpNet::V4(address.trunc());
    let mut out: Vec<IpNet> = Vec::with_capacity(routes.len());
    for route in routes {
        let dest = route.dest.trunc();
        if dest == own || out.contains(&dest) {
            continue;
        }
        out.push(dest);
    }
    out
}
