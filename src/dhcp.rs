//! IP leases for TUN and shadow addresses.
//!
//! The pool of free last octets in `223.254.254.0/24` lives in the
//! `kubetun-traffic-manager` ConfigMap of the namespace:
//!
//! ```text
//! DHCP:   2,3,4,...,99,101,...,253
//! MAC2IP: 0a:1b:2c:3d:4e:5f#223.254.254.37
//! ```
//!
//! Every lease or release is a conditional replace on the ConfigMap's
//! resourceVersion, retried when another client updated it first.

use crate::cluster::{ClusterApi, ClusterError, ConfigMapRecord};
use crate::error::{VpnError, VpnResult};
use ipnet::Ipv4Net;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// ConfigMap holding the pool; also the router pod's name.
pub const TRAFFIC_MANAGER: &str = "kubetun-traffic-manager";
pub const DHCP_KEY: &str = "DHCP";
pub const MAC2IP_KEY: &str = "MAC2IP";

/// Network every lease is carved from.
pub const ROUTER_NETWORK: Ipv4Addr = Ipv4Addr::new(223, 254, 254, 0);
pub const ROUTER_PREFIX: u8 = 24;
/// Octet of the router pod's TUN address.
pub const RESERVED_OCTET: u8 = 100;

const FIRST_OCTET: u8 = 2;
const LAST_OCTET: u8 = 253;
pub(crate) const MAX_UPDATE_ATTEMPTS: usize = 10;

/// How a free octet is picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseStrategy {
    /// Seeded by the machine's MAC address, stable across reconnects.
    #[default]
    Deterministic,
    Random,
}

/// Every leasable octet.
pub fn initial_pool() -> Vec<u8> {
    (FIRST_OCTET..=LAST_OCTET)
        .filter(|&o| o != RESERVED_OCTET)
        .collect()
}

fn in_pool(octet: u8) -> bool {
    (FIRST_OCTET..=LAST_OCTET).contains(&octet) && octet != RESERVED_OCTET
}

/// `/24` address for a leased octet.
pub fn lease_address(octet: u8) -> Ipv4Net {
    let [a, b, c, _] = ROUTER_NETWORK.octets();
    // prefix is a constant below 32
    Ipv4Net::new(Ipv4Addr::new(a, b, c, octet), ROUTER_PREFIX)
        .unwrap_or_else(|_| Ipv4Net::from(Ipv4Addr::new(a, b, c, octet)))
}

/// The router pod's TUN address.
pub fn router_address() -> Ipv4Net {
    lease_address(RESERVED_OCTET)
}

/// Octet of `ip` when it belongs to the router network.
pub fn octet_of(ip: Ipv4Addr) -> Option<u8> {
    let [a, b, c, d] = ip.octets();
    let [na, nb, nc, _] = ROUTER_NETWORK.octets();
    ((a, b, c) == (na, nb, nc)).then_some(d)
}

/// First free octet at or after `sha256(mac) mod 255`, probing upward.
pub fn deterministic_octet(mac: &str, available: &[u8]) -> Option<u8> {
    let digest = Sha256::digest(mac.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    let seed = u64::from_be_bytes(seed);
    (0..255u64)
        .map(|step| (seed.wrapping_add(step) % 255) as u8)
        .find(|octet| available.contains(octet))
}

// ============================================================================
// Pool record
// ============================================================================

/// Parsed contents of the ConfigMap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pool {
    /// Free octets, ascending, without duplicates.
    pub available: Vec<u8>,
    /// MAC -> leased TUN octet.
    pub leases: BTreeMap<String, u8>,
}

impl Pool {
    pub fn full() -> Self {
        Self {
            available: initial_pool(),
            leases: BTreeMap::new(),
        }
    }

    pub fn from_config_map(cm: &ConfigMapRecord) -> Self {
        let mut available: Vec<u8> = cm
            .get(DHCP_KEY)
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .filter(|&o| in_pool(o))
            .collect();
        available.sort_unstable();
        available.dedup();

        let leases = cm
            .get(MAC2IP_KEY)
            .lines()
            .filter_map(|line| {
                let (mac, ip) = line.trim().split_once('#')?;
                let octet = octet_of(ip.parse().ok()?)?;
                Some((mac.to_string(), octet))
            })
            .collect();
        Self { available, leases }
    }

    pub fn write_to(&self, cm: &mut ConfigMapRecord) {
        let available = self
            .available
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let leases = self
            .leases
            .iter()
            .map(|(mac, octet)| format!("{}#{}", mac, lease_address(*octet).addr()))
            .collect::<Vec<_>>()
            .join("\n");
        cm.data.insert(DHCP_KEY.to_string(), available);
        cm.data.insert(MAC2IP_KEY.to_string(), leases);
    }

    /// Take a free octet.
    pub fn take(&mut self, strategy: LeaseStrategy, mac: &str) -> Option<u8> {
        let octet = match strategy {
            LeaseStrategy::Deterministic => deterministic_octet(mac, &self.available)?,
            LeaseStrategy::Random => {
                if self.available.is_empty() {
                    return None;
                }
                let idx = rand::rng().random_range(0..self.available.len());
                self.available[idx]
            }
        };
        self.available.retain(|&o| o != octet);
        Some(octet)
    }

    /// Return an octet, keeping `available` sorted. Octets outside the
    /// pool or already free are ignored.
    pub fn give_back(&mut self, octet: u8) {
        if !in_pool(octet) {
            return;
        }
        if let Err(pos) = self.available.binary_search(&octet) {
            self.available.insert(pos, octet);
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Leases addresses from the namespace's pool for one machine.
pub struct DhcpManager {
    cluster: Arc<dyn ClusterApi>,
    mac: String,
}

impl DhcpManager {
    pub fn new(cluster: Arc<dyn ClusterApi>, mac: impl Into<String>) -> Self {
        Self {
            cluster,
            mac: mac.into(),
        }
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    /// Create the pool ConfigMap unless it exists.
    pub async fn init_if_necessary(&self) -> VpnResult<()> {
        match self.cluster.get_config_map(TRAFFIC_MANAGER).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        let mut cm = ConfigMapRecord::new(TRAFFIC_MANAGER);
        Pool::full().write_to(&mut cm);
        match self.cluster.create_config_map(&cm).await {
            Ok(_) => {
                log::info!("[dhcp] created pool {} in {}", TRAFFIC_MANAGER, self.cluster.namespace());
                Ok(())
            }
            Err(ClusterError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Current pool contents.
    pub async fn pool(&self) -> VpnResult<Pool> {
        let cm = self.cluster.get_config_map(TRAFFIC_MANAGER).await?;
        Ok(Pool::from_config_map(&cm))
    }

    /// Lease an octet without recording it against this machine.
    pub async fn rent_ip(&self, strategy: LeaseStrategy) -> VpnResult<Ipv4Net> {
        let mac = self.mac.clone();
        let octet = self
            .update(move |pool| {
                pool.take(strategy, &mac)
                    .ok_or_else(|| VpnError::IpAssignment("no free address in pool".into()))
            })
            .await?;
        let addr = lease_address(octet);
        log::debug!("[dhcp] leased {}", addr);
        Ok(addr)
    }

    /// Lease this machine's TUN address, reusing its recorded lease.
    pub async fn rent_ip_for_mac(&self) -> VpnResult<Ipv4Net> {
        let mac = self.mac.clone();
        let octet = self
            .update(move |pool| {
                if let Some(&octet) = pool.leases.get(&mac) {
                    pool.available.retain(|&o| o != octet);
                    return Ok(octet);
                }
                let octet = pool
                    .take(LeaseStrategy::Deterministic, &mac)
                    .ok_or_else(|| VpnError::IpAssignment("no free address in pool".into()))?;
                pool.leases.insert(mac.clone(), octet);
                Ok(octet)
            })
            .await?;
        let addr = lease_address(octet);
        log::info!("[dhcp] {} leased {}", self.mac, addr);
        Ok(addr)
    }

    /// Return addresses to the pool.
    pub async fn release_ips(&self, ips: &[Ipv4Addr]) -> VpnResult<()> {
        let octets: Vec<u8> = ips.iter().filter_map(|ip| octet_of(*ip)).collect();
        self.update(move |pool| {
            for &octet in &octets {
                pool.leases.retain(|_, leased| *leased != octet);
                pool.give_back(octet);
            }
            Ok(())
        })
        .await?;
        log::debug!("[dhcp] released {:?}", ips);
        Ok(())
    }

    /// Drop this machine's lease record and return its octet.
    pub async fn release_ip_for_mac(&self) -> VpnResult<()> {
        let mac = self.mac.clone();
        self.update(move |pool| {
            if let Some(octet) = pool.leases.remove(&mac) {
                pool.give_back(octet);
            }
            Ok(())
        })
        .await
    }

    /// Read-modify-write with retry on conflict. Skips the write when `f`
    /// leaves the pool unchanged.
    async fn update<T, F>(&self, mut f: F) -> VpnResult<T>
    where
        F: FnMut(&mut Pool) -> VpnResult<T> + Send,
        T: Send,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let mut cm = self.cluster.get_config_map(TRAFFIC_MANAGER).await?;
            let before = Pool::from_config_map(&cm);
            let mut pool = before.clone();
            let value = f(&mut pool)?;
            if pool == before {
                return Ok(value);
            }
            pool.write_to(&mut cm);
            match self.cluster.replace_config_map(&cm).await {
                Ok(_) => return Ok(value),
                Err(e) if e.is_conflict() => {
                    log::debug!("[dhcp] pool changed concurrently (attempt {})", attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(VpnError::IpAssignment(format!(
            "pool update kept conflicting after {} attempts",
            MAX_UPDATE_ATTEMPTS
        )))
    }
}

// ============================================================================
// MAC address
// ============================================================================

fn usable_mac(mac: &str) -> bool {
    let mac = mac.trim();
    mac.len() == 17 && mac != "00:00:00:00:00:00"
}

/// MAC address of the first physical-looking interface.
pub async fn local_mac_address() -> VpnResult<String> {
    if cfg!(target_os = "linux") {
        let mut entries = tokio::fs::read_dir("/sys/class/net").await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        for name in names.iter().filter(|n| n.as_str() != "lo") {
            let path = format!("/sys/class/net/{}/address", name);
            if let Ok(mac) = tokio::fs::read_to_string(&path).await {
                if usable_mac(&mac) {
                    return Ok(mac.trim().to_ascii_lowercase());
                }
            }
        }
    } else {
        let output = tokio::process::Command::new("ifconfig").output().await?;
        let text = String::from_utf8_lossy(&output.stdout);
        if let Some(mac) = text
            .lines()
            .filter_map(|l| l.trim().strip_prefix("ether "))
            .map(|rest| rest.split_whitespace().next().unwrap_or(""))
            .find(|mac| usable_mac(mac))
        {
            return Ok(mac.to_ascii_lowercase());
        }
    }
    Err(VpnError::config("no network interface with a MAC address"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;

    const MAC: &str = "0a:1b:2c:3d:4e:5f";

    async fn manager() -> (Arc<InMemoryCluster>, DhcpManager) {
        let cluster = Arc::new(InMemoryCluster::default());
        let dhcp = DhcpManager::new(cluster.clone(), MAC);
        dhcp.init_if_necessary().await.unwrap();
        (cluster, dhcp)
    }

    #[test]
    fn test_initial_pool_excludes_reserved() {
        let pool = initial_pool();
        assert_eq!(pool.len(), 251);
        assert_eq!(pool.first(), Some(&2));
        assert_eq!(pool.last(), Some(&253));
        assert!(!pool.contains(&RESERVED_OCTET));
    }

    #[test]
    fn test_pool_parse_sorts_numerically() {
        let mut cm = ConfigMapRecord::new(TRAFFIC_MANAGER);
        cm.data.insert(DHCP_KEY.into(), "10,9,100,2,2,254,x".into());
        cm.data.insert(MAC2IP_KEY.into(), format!("{}#223.254.254.7\nbogus", MAC));
        let pool = Pool::from_config_map(&cm);
        assert_eq!(pool.available, vec![2, 9, 10]);
        assert_eq!(pool.leases.get(MAC), Some(&7));

        let mut out = ConfigMapRecord::new(TRAFFIC_MANAGER);
        pool.write_to(&mut out);
        assert_eq!(out.get(DHCP_KEY), "2,9,10");
        assert_eq!(out.get(MAC2IP_KEY), format!("{}#223.254.254.7", MAC));
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let (cluster, dhcp) = manager().await;
        let before = cluster.mutations();
        dhcp.init_if_necessary().await.unwrap();
        assert_eq!(cluster.mutations(), before);
        assert_eq!(dhcp.pool().await.unwrap().available, initial_pool());
    }

    #[tokio::test]
    async fn test_pool_conservation() {
        let (_cluster, dhcp) = manager().await;
        let mut leased = Vec::new();
        for i in 0..20 {
            let strategy = if i % 2 == 0 {
                LeaseStrategy::Deterministic
            } else {
                LeaseStrategy::Random
            };
            leased.push(dhcp.rent_ip(strategy).await.unwrap().addr());
            if i % 3 == 2 {
                let ip = leased.remove(0);
                dhcp.release_ips(&[ip]).await.unwrap();
                // double release is a no-op
                dhcp.release_ips(&[ip]).await.unwrap();
            }

            let available = dhcp.pool().await.unwrap().available;
            let mut union: Vec<u8> = available.clone();
            union.extend(leased.iter().filter_map(|ip| octet_of(*ip)));
            union.sort_unstable();
            assert_eq!(union, initial_pool(), "after step {}", i);
            let mut dedup = available.clone();
            dedup.dedup();
            assert_eq!(dedup, available);
        }
    }

    #[tokio::test]
    async fn test_deterministic_lease_is_stable() {
        let (_c1, first) = manager().await;
        let (_c2, second) = manager().await;
        let a = first.rent_ip(LeaseStrategy::Deterministic).await.unwrap();
        let b = second.rent_ip(LeaseStrategy::Deterministic).await.unwrap();
        assert_eq!(a, b);

        first.release_ips(&[a.addr()]).await.unwrap();
        let again = first.rent_ip(LeaseStrategy::Deterministic).await.unwrap();
        assert_eq!(again, a);
    }

    #[test]
    fn test_deterministic_octet_probes_forward() {
        let all = initial_pool();
        let first = deterministic_octet(MAC, &all).unwrap();
        let without: Vec<u8> = all.iter().copied().filter(|&o| o != first).collect();
        let next = deterministic_octet(MAC, &without).unwrap();
        assert_ne!(next, first);
        assert_eq!(deterministic_octet(MAC, &[]), None);
    }

    #[tokio::test]
    async fn test_mac_lease_is_reused() {
        let (_cluster, dhcp) = manager().await;
        let tun = dhcp.rent_ip_for_mac().await.unwrap();
        let again = dhcp.rent_ip_for_mac().await.unwrap();
        assert_eq!(tun, again);
        assert!(!dhcp.pool().await.unwrap().available.contains(&octet_of(tun.addr()).unwrap()));

        dhcp.release_ip_for_mac().await.unwrap();
        let pool = dhcp.pool().await.unwrap();
        assert!(pool.leases.is_empty());
        assert_eq!(pool.available, initial_pool());
    }

    #[tokio::test]
    async fn test_update_retries_on_conflict() {
        let (cluster, dhcp) = manager().await;
        cluster.inject_conflicts(3);
        dhcp.rent_ip(LeaseStrategy::Random).await.unwrap();
        assert_eq!(dhcp.pool().await.unwrap().available.len(), 250);

        cluster.inject_conflicts(MAX_UPDATE_ATTEMPTS);
        let err = dhcp.rent_ip(LeaseStrategy::Random).await.unwrap_err();
        assert!(matches!(err, VpnError::IpAssignment(_)));
        assert_eq!(dhcp.pool().await.unwrap().available.len(), 250);
    }

    #[tokio::test]
    async fn test_exhausted_pool() {
        let (_cluster, dhcp) = manager().await;
        for _ in 0..initial_pool().len() {
            dhcp.rent_ip(LeaseStrategy::Random).await.unwrap();
        }
        let err = dhcp.rent_ip(LeaseStrategy::Deterministic).await.unwrap_err();
        assert!(matches!(err, VpnError::IpAssignment(_)));
    }
}
