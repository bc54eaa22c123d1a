//! IP header sniffing for the TUN router.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Minimum IPv4 header size (20 bytes, no options).
const IPV4_MIN_HEADER: usize = 20;

/// Minimum IPv6 header size (40 bytes fixed).
const IPV6_MIN_HEADER: usize = 40;

/// IPv4 version nibble.
const IP_VERSION_4: u8 = 4;

/// IPv6 version nibble.
const IP_VERSION_6: u8 = 6;

/// Addresses pulled from an IP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpHeader {
    pub version: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
}

/// Why a buffer was not accepted as an IP packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("unknown packet (first byte {0:#04x})")]
    Unknown(u8),
    #[error("empty packet")]
    Empty,
    #[error("truncated IPv{version} header: {len} bytes")]
    Truncated { version: u8, len: usize },
    #[error("bad IPv4 header length {0}")]
    BadHeaderLength(usize),
}

/// Parse the version, source and destination of an IPv4 or IPv6 packet.
pub fn parse_header(packet: &[u8]) -> Result<IpHeader, HeaderError> {
    let first = *packet.first().ok_or(HeaderError::Empty)?;
    match first >> 4 {
        IP_VERSION_4 => {
            if packet.len() < IPV4_MIN_HEADER {
                return Err(HeaderError::Truncated {
                    version: 4,
                    len: packet.len(),
                });
            }
            let ihl = ((first & 0x0f) as usize) * 4;
            if ihl < IPV4_MIN_HEADER || ihl > packet.len() {
                return Err(HeaderError::BadHeaderLength(ihl));
            }
            Ok(IpHeader {
                version: 4,
                src: IpAddr::V4(read_ipv4_addr(packet, 12)),
                dst: IpAddr::V4(read_ipv4_addr(packet, 16)),
            })
        }
        IP_VERSION_6 => {
            if packet.len() < IPV6_MIN_HEADER {
                return Err(HeaderError::Truncated {
                    version: 6,
                    len: packet.len(),
                });
            }
            Ok(IpHeader {
                version: 6,
                src: IpAddr::V6(read_ipv6_addr(packet, 8)),
                dst: IpAddr::V6(read_ipv6_addr(packet, 24)),
            })
        }
        _ => Err(HeaderError::Unknown(first)),
    }
}

#[inline]
fn read_ipv4_addr(packet: &[u8], offset: usize) -> Ipv4Addr {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&packet[offset..offset + 4]);
    Ipv4Addr::from(bytes)
}

#[inline]
fn read_ipv6_addr(packet: &[u8], offset: usize) -> Ipv6Addr {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&packet[offset..offset + 16]);
    Ipv6Addr::from(bytes)
}

/// Minimal IPv4 packet builder for tests in this crate.
#[cfg(test)]
pub(crate) fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = (IPV4_MIN_HEADER + payload.len()) as u16;
    let mut p = vec![0u8; IPV4_MIN_HEADER];
    p[0] = 0x45;
    p[2..4].copy_from_slice(&total.to_be_bytes());
    p[8] = 64;
    p[9] = 17;
    p[12..16].copy_from_slice(&src.octets());
    p[16..20].copy_from_slice(&dst.octets());
    p.extend_from_slice(payload);
    p
}
