//! Detecting host interfaces whose routes overlap the tunnel's.
//!
//! Another VPN or bridge owning a network that also goes through the TUN
//! device can swallow cluster traffic. Such interfaces are found from the
//! OS routing table and, on request, brought down.

use crate::error::{VpnError, VpnResult};
use ipnet::{IpNet, Ipv4Net};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tokio::process::Command;

/// Interface name -> networks routed through it.
pub type RouteTable = BTreeMap<String, Vec<IpNet>>;

fn insert(table: &mut RouteTable, iface: &str, net: IpNet) {
    let routes = table.entry(iface.to_string()).or_default();
    if !routes.contains(&net) {
        routes.push(net);
    }
}

/// Parse a BSD routing destination: `default`, `10.0.5/24`, `10.1`,
/// `192.168.1.7`, `fe80::%utun0/64`. Missing IPv4 octets are zero and,
/// without a `/len`, the prefix covers the octets written.
pub fn parse_bsd_destination(dest: &str) -> Option<IpNet> {
    let (addr, prefix) = match dest.split_once('/') {
        Some((a, p)) => (a, Some(p.parse::<u8>().ok()?)),
        None => (dest, None),
    };
    // scoped IPv6 (`fe80::1%lo0`)
    let addr = addr.split('%').next().unwrap_or(addr);

    if addr.contains(':') {
        let ip: std::net::Ipv6Addr = addr.parse().ok()?;
        let net = ipnet::Ipv6Net::new(ip, prefix.unwrap_or(128)).ok()?;
        return Some(IpNet::V6(net.trunc()));
    }

    let parts: Vec<&str> = addr.split('.').collect();
    if parts.is_empty() || parts.len() > 4 {
        return None;
    }
    let mut octets = [0u8; 4];
    for (slot, part) in octets.iter_mut().zip(&parts) {
        *slot = part.parse().ok()?;
    }
    let prefix = prefix.unwrap_or(parts.len() as u8 * 8);
    let net = Ipv4Net::new(Ipv4Addr::from(octets), prefix).ok()?;
    Some(IpNet::V4(net.trunc()))
}

/// Parse `netstat -anr` (macOS). Columns: destination, gateway, flags,
/// interface.
pub fn parse_netstat(output: &str) -> RouteTable {
    let mut table = RouteTable::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        if let Some(net) = parse_bsd_destination(fields[0]) {
            insert(&mut table, fields[3], net);
        }
    }
    table
}

/// Parse `route -n` (Linux). Columns: destination, gateway, genmask,
/// flags, metric, ref, use, interface.
pub fn parse_route_n(output: &str) -> RouteTable {
    let mut table = RouteTable::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let (Ok(dest), Ok(mask)) = (fields[0].parse::<Ipv4Addr>(), fields[2].parse::<Ipv4Addr>())
        else {
            continue;
        };
        let Ok(prefix) = ipnet::ipv4_mask_to_prefix(mask) else {
            continue;
        };
        if let Ok(net) = Ipv4Net::new(dest, prefix) {
            insert(&mut table, fields[7], IpNet::V4(net.trunc()));
        }
    }
    table
}

/// Default routes and networks that collapse to the unspecified address.
fn is_default_like(net: &IpNet) -> bool {
    net.prefix_len() == 0 || net.network().is_unspecified()
}

fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(b) || b.contains(a)
}

/// Interfaces other than `tun` owning a route that overlaps one of `tun`'s
/// routes without being more specific than it.
pub fn detect_conflicts(table: &RouteTable, tun: &str) -> Vec<String> {
    let Some(own) = table.get(tun) else {
        return Vec::new();
    };
    let own: Vec<&IpNet> = own.iter().filter(|n| !is_default_like(n)).collect();

    let mut conflicts = Vec::new();
    for (iface, routes) in table {
        if iface == tun {
            continue;
        }
        let clash = routes.iter().filter(|n| !is_default_like(n)).find_map(|other| {
            own.iter()
                .find(|mine| overlaps(mine, other) && mine.prefix_len() >= other.prefix_len())
                .map(|mine| (*mine, other))
        });
        if let Some((mine, other)) = clash {
            log::warn!("{} routes {} which overlaps {} on {}", iface, other, mine, tun);
            conflicts.push(iface.clone());
        }
    }
    conflicts
}

async fn command_stdout(program: &str, args: &[&str]) -> VpnResult<String> {
    let output = Command::new(program).args(args).output().await.map_err(|e| {
        VpnError::config_with_source(format!("Failed to execute {}", program), e)
    })?;
    if !output.status.success() {
        return Err(VpnError::config(format!(
            "{} {}: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// The host routing table. Empty where reading it is not supported.
pub async fn route_table() -> VpnResult<RouteTable> {
    if cfg!(target_os = "linux") {
        Ok(parse_route_n(&command_stdout("route", &["-n"]).await?))
    } else if cfg!(target_os = "macos") {
        Ok(parse_netstat(&command_stdout("netstat", &["-anr"]).await?))
    } else {
        log::debug!("route table not available on this platform");
        Ok(RouteTable::new())
    }
}

/// Bring `devices` down.
pub async fn disable_devices(devices: &[String]) -> VpnResult<()> {
    for dev in devices {
        log::warn!("disabling conflicting interface {}", dev);
        command_stdout("ifconfig", &[dev.as_str(), "down"]).await?;
    }
    Ok(())
}

/// Find interfaces conflicting with `tun` and optionally disable them.
pub async fn detect_and_disable(tun: &str, disable: bool) -> VpnResult<Vec<String>> {
    let table = route_table().await?;
    let conflicts = detect_conflicts(&table, tun);
    if disable && !conflicts.is_empty() {
        disable_devices(&conflicts).await?;
    }
    Ok(conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_contained_route_marks_wider_interface() {
        let mut table = RouteTable::new();
        table.insert("en1".into(), vec![net("10.0.0.0/16")]);
        table.insert("utun4".into(), vec![net("10.0.5.0/24")]);
        table.insert("en0".into(), vec![net("192.168.1.0/24"), net("0.0.0.0/0")]);

        assert_eq!(detect_conflicts(&table, "utun4"), vec!["en1".to_string()]);
        // the more specific interface is never the conflicting one
        assert!(detect_conflicts(&table, "en1").is_empty());
    }

    #[test]
    fn test_default_routes_ignored() {
        let mut table = RouteTable::new();
        table.insert("en0".into(), vec![net("0.0.0.0/0")]);
        table.insert("utun4".into(), vec![net("10.0.5.0/24"), net("0.0.0.0/1")]);
        assert!(detect_conflicts(&table, "utun4").is_empty());
        assert!(detect_conflicts(&table, "missing").is_empty());
    }

    #[test]
    fn test_parse_bsd_destination() {
        assert_eq!(parse_bsd_destination("10.0.5/24"), Some(net("10.0.5.0/24")));
        assert_eq!(parse_bsd_destination("10.1"), Some(net("10.1.0.0/16")));
        assert_eq!(parse_bsd_destination("192.168.1.7"), Some(net("192.168.1.7/32")));
        assert_eq!(parse_bsd_destination("fe80::%utun0/64"), Some(net("fe80::/64")));
        assert_eq!(parse_bsd_destination("default"), None);
        assert_eq!(parse_bsd_destination("link#4"), None);
    }

    #[test]
    fn test_parse_netstat() {
        let output = "\
Routing tables

Internet:
Destination        Gateway            Flags        Netif Expire
default            192.168.1.1        UGScg          en0
10.0/16            link#12            UCS          utun3
223.254.254/24     223.254.254.2      UGSc         utun5
223.254.254.2      223.254.254.2      UH           utun5
";
        let table = parse_netstat(output);
        assert_eq!(table["utun3"], vec![net("10.0.0.0/16")]);
        assert_eq!(table["utun5"].len(), 2);
        assert!(!table.contains_key("en0"));
    }

    #[test]
    fn test_parse_route_n() {
        let output = "\
Kernel IP routing table
Destination     Gateway         Genmask         Flags Metric Ref    Use Iface
0.0.0.0         192.168.1.1     0.0.0.0         UG    100    0        0 eth0
10.0.0.0        0.0.0.0         255.255.0.0     U     0      0        0 docker0
10.0.5.0        0.0.0.0         255.255.255.0   U     0      0        0 tun0
";
        let table = parse_route_n(output);
        assert_eq!(table["eth0"], vec![net("0.0.0.0/0")]);
        assert_eq!(table["tun0"], vec![net("10.0.5.0/24")]);
        assert_eq!(detect_conflicts(&table, "tun0"), vec!["docker0".to_string()]);
    }
}
