//! Datagram connections: real UDP sockets and UDP tunneled over a stream.

use crate::error::{VpnError, VpnResult};
use crate::proxy::datagram::DatagramPacket;
use crate::proxy::transport::IoStream;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

/// Datagram connection usable concurrently from a reader and a writer task.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Receive one datagram, returning its length and sender.
    async fn recv_from(&self, buf: &mut [u8]) -> VpnResult<(usize, SocketAddr)>;

    /// Send one datagram to `target`.
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> VpnResult<usize>;

    /// Local address, when bound to one.
    fn local_addr(&self) -> Option<SocketAddr>;
}

#[async_trait]
impl PacketConn for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> VpnResult<(usize, SocketAddr)> {
        Ok(UdpSocket::recv_from(self, buf).await?)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> VpnResult<usize> {
        Ok(UdpSocket::send_to(self, buf, target).await?)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        UdpSocket::local_addr(self).ok()
    }
}

/// UDP semantics over a byte stream, one datagram frame per packet.
///
/// Reads and writes use independent halves so one task can block in
/// `recv_from` while another sends.
pub struct FakeUdpTunnelConn {
    reader: Mutex<ReadHalf<IoStream>>,
    writer: Mutex<WriteHalf<IoStream>>,
    target: String,
}

impl FakeUdpTunnelConn {
    /// Wrap `stream`; `target` is the default peer for [`FakeUdpTunnelConn::send`].
    pub fn new(stream: IoStream, target: &str) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            target: target.to_string(),
        }
    }

    /// Send to the default target.
    pub async fn send(&self, buf: &[u8]) -> VpnResult<usize> {
        let packet = DatagramPacket::new(&self.target, buf.to_vec());
        let mut writer = self.writer.lock().await;
        packet.write_to(&mut *writer).await?;
        Ok(buf.len())
    }
}

#[async_trait]
impl PacketConn for FakeUdpTunnelConn {
    async fn recv_from(&self, buf: &mut [u8]) -> VpnResult<(usize, SocketAddr)> {
        let (n, addr) = {
            let mut reader = self.reader.lock().await;
            DatagramPacket::read_into(&mut *reader, buf).await?
        };
        let peer = resolve_udp_addr(&addr).await?;
        Ok((n, peer))
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> VpnResult<usize> {
        let packet = DatagramPacket::from_socket_addr(target, buf.to_vec());
        let mut writer = self.writer.lock().await;
        packet.write_to(&mut *writer).await?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Resolve `host:port` to a socket address, going through DNS for names.
pub async fn resolve_udp_addr(addr: &str) -> VpnResult<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| VpnError::Protocol(format!("cannot resolve datagram address {}", addr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_fake_udp_conn_frames_both_ways() {
        let (local, remote) = tokio::io::duplex(4096);
        let conn = FakeUdpTunnelConn::new(Box::new(local), "10.0.0.9:8421");
        let (mut remote_r, mut remote_w) = tokio::io::split(remote);

        let target: SocketAddr = "10.0.0.9:8421".parse().unwrap();
        conn.send_to(b"outbound", target).await.unwrap();
        let frame = DatagramPacket::read_from(&mut remote_r).await.unwrap();
        assert_eq!(frame.addr(), "10.0.0.9:8421");
        assert_eq!(&frame.data[..], b"outbound");

        let mut wire = bytes::BytesMut::new();
        DatagramPacket::new("10.0.0.7:5353", &b"inbound"[..])
            .encode(&mut wire)
            .unwrap();
        remote_w.write_all(&wire).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = conn.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"inbound");
        assert_eq!(from, "10.0.0.7:5353".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_send_uses_default_target() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let conn = FakeUdpTunnelConn::new(Box::new(local), "127.0.0.1:8421");
        conn.send(b"x").await.unwrap();
        let frame = DatagramPacket::read_from(&mut remote).await.unwrap();
        assert_eq!(frame.port, 8421);
    }

    #[tokio::test]
    async fn test_closed_stream_reports_error() {
        let (local, remote) = tokio::io::duplex(64);
        let conn = FakeUdpTunnelConn::new(Box::new(local), "127.0.0.1:1");
        drop(remote);
        let mut buf = [0u8; 16];
        assert!(conn.recv_from(&mut buf).await.is_err());
    }
}
