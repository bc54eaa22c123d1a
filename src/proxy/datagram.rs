//! UDP-over-TCP datagram framing.
//!
//! Each UDP datagram carried through a TCP/TLS stream is framed as
//! (all integers big-endian):
//!
//! ```text
//! +------+----------------+------+--------+-----------------+
//! | type | host           | port | length | payload         |
//! |  1B  | 4B / 16B / 1+N |  2B  |   2B   | `length` bytes  |
//! +------+----------------+------+--------+-----------------+
//! ```
//!
//! `type` is 1 (IPv4, raw 4-byte host), 2 (IPv6, raw 16-byte host) or
//! 3 (domain, one length byte followed by the name).

use crate::error::{VpnError, VpnResult};
use crate::proxy::buffer::{BufferPool, MAX_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Address type tag carried in the first byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddrType {
    Ipv4 = 1,
    Ipv6 = 2,
    Domain = 3,
}

impl TryFrom<u8> for AddrType {
    type Error = VpnError;

    fn try_from(value: u8) -> VpnResult<Self> {
        match value {
            1 => Ok(AddrType::Ipv4),
            2 => Ok(AddrType::Ipv6),
            3 => Ok(AddrType::Domain),
            other => Err(VpnError::Protocol(format!(
                "unknown datagram address type {}",
                other
            ))),
        }
    }
}

/// One framed UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramPacket {
    pub addr_type: AddrType,
    /// Textual host: dotted IPv4, IPv6 without brackets, or a domain name.
    pub host: String,
    pub port: u16,
    pub data: Bytes,
}

/// Header fields of a frame, decoded before the payload is read.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    addr_type: AddrType,
    host: String,
    port: u16,
    length: u16,
}

impl DatagramPacket {
    /// Build a packet for `addr` (`host:port`), classifying the host by syntax.
    ///
    /// Two or more colons mean IPv6; otherwise a host that parses as an IP is
    /// IPv4; anything else is a domain. Malformed input never fails: it ends
    /// up as a domain-typed packet with an empty host.
    pub fn new(addr: &str, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let (host, port) = split_host_port(addr).unwrap_or_default();

        let addr_type = if addr.matches(':').count() >= 2 {
            AddrType::Ipv6
        } else if addr
            .split(':')
            .next()
            .is_some_and(|h| h.parse::<IpAddr>().is_ok())
        {
            AddrType::Ipv4
        } else {
            AddrType::Domain
        };

        // A host that contradicts its tag cannot be encoded; degrade to domain.
        let valid = match addr_type {
            AddrType::Ipv4 => host.parse::<Ipv4Addr>().is_ok(),
            AddrType::Ipv6 => host.parse::<Ipv6Addr>().is_ok(),
            AddrType::Domain => host.len() <= u8::MAX as usize,
        };
        if !valid {
            return Self {
                addr_type: AddrType::Domain,
                host: String::new(),
                port,
                data,
            };
        }

        Self {
            addr_type,
            host,
            port,
            data,
        }
    }

    /// Build a packet for a resolved socket address.
    pub fn from_socket_addr(addr: SocketAddr, data: impl Into<Bytes>) -> Self {
        let (addr_type, host) = match addr.ip().to_canonical() {
            IpAddr::V4(v4) => (AddrType::Ipv4, v4.to_string()),
            IpAddr::V6(v6) => (AddrType::Ipv6, v6.to_string()),
        };
        Self {
            addr_type,
            host,
            port: addr.port(),
            data: data.into(),
        }
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// Socket address when the host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.host.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }

    /// Payload length as carried on the wire.
    pub fn data_length(&self) -> u16 {
        self.data.len() as u16
    }

    /// Append the encoded frame to `buf`.
    ///
    /// Fails when the payload does not fit the 16-bit length field.
    pub fn encode(&self, buf: &mut BytesMut) -> VpnResult<()> {
        if self.data.len() > MAX_PAYLOAD_SIZE {
            return Err(VpnError::Protocol(format!(
                "datagram payload of {} bytes exceeds {}",
                self.data.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        buf.reserve(MAX_HEADER_SIZE + self.data.len());
        buf.put_u8(self.addr_type as u8);
        match self.addr_type {
            AddrType::Ipv4 => {
                let ip: Ipv4Addr = self.host.parse().unwrap_or(Ipv4Addr::UNSPECIFIED);
                buf.put_slice(&ip.octets());
            }
            AddrType::Ipv6 => {
                let ip: Ipv6Addr = self.host.parse().unwrap_or(Ipv6Addr::UNSPECIFIED);
                buf.put_slice(&ip.octets());
            }
            AddrType::Domain => {
                let host = &self.host.as_bytes()[..self.host.len().min(u8::MAX as usize)];
                buf.put_u8(host.len() as u8);
                buf.put_slice(host);
            }
        }
        buf.put_u16(self.port);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
        Ok(())
    }

    /// Serialize and send the frame with a single write.
    pub async fn write_to<W>(&self, writer: &mut W) -> VpnResult<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        writer.write_all(&buf).await?;
        Ok(())
    }

    /// Read one frame from `reader`.
    ///
    /// A stream that ends mid-frame yields an `UnexpectedEof` network error;
    /// an unknown type byte yields a protocol error.
    pub async fn read_from<R>(reader: &mut R) -> VpnResult<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let header = read_header(reader).await?;
        let pool = BufferPool::global();
        let mut buf = pool.get();
        let len = header.length as usize;
        reader.read_exact(&mut buf[..len]).await?;
        Ok(Self {
            addr_type: header.addr_type,
            host: header.host,
            port: header.port,
            data: Bytes::copy_from_slice(&buf[..len]),
        })
    }

    /// Read one frame, placing the payload directly into `buf`.
    ///
    /// Returns the payload length and the frame's `host:port`. A frame whose
    /// payload is larger than `buf` is a protocol error; the payload is
    /// drained so the stream stays aligned on frame boundaries.
    pub async fn read_into<R>(reader: &mut R, buf: &mut [u8]) -> VpnResult<(usize, String)>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let header = read_header(reader).await?;
        let len = header.length as usize;
        if len > buf.len() {
            let mut sink = BufferPool::global().get();
            reader.read_exact(&mut sink[..len]).await?;
            return Err(VpnError::Protocol(format!(
                "datagram of {} bytes does not fit {}-byte buffer",
                len,
                buf.len()
            )));
        }
        reader.read_exact(&mut buf[..len]).await?;
        Ok((len, join_host_port(&header.host, header.port)))
    }
}

async fn read_header<R>(reader: &mut R) -> VpnResult<Header>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let addr_type = AddrType::try_from(reader.read_u8().await?)?;
    let host = match addr_type {
        AddrType::Ipv4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        AddrType::Ipv6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        AddrType::Domain => {
            let len = reader.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name).await?;
            String::from_utf8(name)
                .map_err(|_| VpnError::Protocol("datagram domain is not UTF-8".into()))?
        }
    };
    let port = reader.read_u16().await?;
    let length = reader.read_u16().await?;
    Ok(Header {
        addr_type,
        host,
        port,
        length,
    })
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some((host.to_string(), port))
}

/// Inverse of [`split_host_port`].
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn round_trip(packet: &DatagramPacket) -> DatagramPacket {
        let mut wire = Vec::new();
        packet.write_to(&mut wire).await.unwrap();
        DatagramPacket::read_from(&mut Cursor::new(wire)).await.unwrap()
    }

    #[test]
    fn test_classify_address() {
        assert_eq!(DatagramPacket::new("10.0.0.1:53", &b""[..]).addr_type, AddrType::Ipv4);
        assert_eq!(DatagramPacket::new("[fd00::1]:53", &b""[..]).addr_type, AddrType::Ipv6);
        let domain = DatagramPacket::new("kube-dns.kube-system:53", &b""[..]);
        assert_eq!(domain.addr_type, AddrType::Domain);
        assert_eq!(domain.host, "kube-dns.kube-system");
        assert_eq!(domain.port, 53);
    }

    #[test]
    fn test_malformed_address_becomes_empty_domain() {
        let packet = DatagramPacket::new("not an address", &b"x"[..]);
        assert_eq!(packet.addr_type, AddrType::Domain);
        assert!(packet.host.is_empty());
        assert_eq!(packet.port, 0);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let payload = vec![0xabu8; 1400];
        for addr in ["223.254.254.2:8421", "[2001:db8::7]:8421", "router.local:8421"] {
            let packet = DatagramPacket::new(addr, payload.clone());
            let decoded = round_trip(&packet).await;
            assert_eq!(decoded.addr_type, packet.addr_type);
            assert_eq!(decoded.host, packet.host);
            assert_eq!(decoded.port, 8421);
            assert_eq!(decoded.data, packet.data);
            assert_eq!(decoded.addr(), addr);
        }
    }

    #[tokio::test]
    async fn test_max_payload_round_trip() {
        let packet = DatagramPacket::new("10.1.2.3:9", vec![7u8; MAX_PAYLOAD_SIZE]);
        let decoded = round_trip(&packet).await;
        assert_eq!(decoded.data.len(), MAX_PAYLOAD_SIZE);
        assert_eq!(decoded.data_length() as usize, MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_wire_layout_ipv4() {
        let packet = DatagramPacket::new("1.2.3.4:258", &b"hi"[..]);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[1, 1, 2, 3, 4, 0x01, 0x02, 0x00, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let packet = DatagramPacket::new("1.2.3.4:1", vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        let mut buf = BytesMut::new();
        assert!(matches!(packet.encode(&mut buf), Err(VpnError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_io_error() {
        let packet = DatagramPacket::new("1.2.3.4:1", vec![1u8; 32]);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        let truncated = buf[..buf.len() - 5].to_vec();
        let err = DatagramPacket::read_from(&mut Cursor::new(truncated))
            .await
            .unwrap_err();
        match err {
            VpnError::Network(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_type_is_protocol_error() {
        let wire = vec![9u8, 0, 0, 0, 0];
        let err = DatagramPacket::read_from(&mut Cursor::new(wire)).await.unwrap_err();
        assert!(matches!(err, VpnError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_read_into_small_buffer_keeps_alignment() {
        let mut wire = BytesMut::new();
        DatagramPacket::new("1.1.1.1:1", vec![1u8; 100]).encode(&mut wire).unwrap();
        DatagramPacket::new("2.2.2.2:2", vec![2u8; 10]).encode(&mut wire).unwrap();
        let mut reader = Cursor::new(wire.to_vec());

        let mut small = [0u8; 50];
        assert!(DatagramPacket::read_into(&mut reader, &mut small).await.is_err());
        let (n, addr) = DatagramPacket::read_into(&mut reader, &mut small).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(addr, "2.2.2.2:2");
        assert_eq!(&small[..n], &[2u8; 10]);
    }

    #[test]
    fn test_split_join_host_port() {
        assert_eq!(split_host_port("[::1]:80"), Some(("::1".to_string(), 80)));
        assert_eq!(split_host_port(":8421"), Some((String::new(), 8421)));
        assert_eq!(split_host_port("nohost"), None);
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
        assert_eq!(join_host_port("a.b", 80), "a.b:80");
    }
}
