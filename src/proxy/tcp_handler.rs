//! Server side of UDP-over-TCP.
//!
//! Each accepted stream gets its own ephemeral UDP socket. Datagram frames
//! read from the stream are sent to the address they carry; datagrams the
//! socket receives are framed with their sender and written back.

use crate::error::{VpnError, VpnResult};
use crate::proxy::buffer::BufferPool;
use crate::proxy::datagram::DatagramPacket;
use crate::proxy::handler::{Accepted, Handler, HandlerOptions};
use crate::proxy::packet_conn::resolve_udp_addr;
use crate::proxy::transport::IoStream;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Relays framed datagrams between a stream and a UDP socket.
pub struct TcpHandler {
    options: HandlerOptions,
}

impl TcpHandler {
    pub fn new(options: HandlerOptions) -> Self {
        Self { options }
    }

    /// Relay until either side fails or `token` is cancelled.
    pub async fn relay(
        &self,
        token: CancellationToken,
        stream: IoStream,
        peer: SocketAddr,
    ) -> VpnResult<()> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        log::debug!(
            "[tcp] {} -> {} : udp relay on {}",
            peer,
            self.options.node.addr,
            socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default()
        );
        let (reader, writer) = tokio::io::split(stream);

        let mut tasks = JoinSet::new();
        tasks.spawn(udp_to_stream(socket.clone(), writer));
        tasks.spawn(stream_to_udp(reader, socket));

        let result = tokio::select! {
            _ = token.cancelled() => Ok(()),
            Some(joined) = tasks.join_next() => match joined {
                Ok(r) => r,
                Err(e) => Err(VpnError::ConnectionLost(format!("relay task failed: {}", e))),
            },
        };
        tasks.shutdown().await;
        log::debug!("[tcp] {} relay closed", peer);
        result
    }
}

#[async_trait]
impl Handler for TcpHandler {
    async fn handle(&self, token: CancellationToken, conn: Accepted) -> VpnResult<()> {
        match conn {
            Accepted::Stream { stream, peer } => self.relay(token, stream, peer).await,
            other => Err(VpnError::Unsupported(format!("{:?} on tcp handler", other))),
        }
    }
}

async fn udp_to_stream(socket: Arc<UdpSocket>, mut writer: WriteHalf<IoStream>) -> VpnResult<()> {
    let pool = BufferPool::global();
    loop {
        let mut buf = pool.get();
        let (n, from) = socket.recv_from(&mut buf).await?;
        write_frame(&mut writer, from, &buf[..n]).await?;
    }
}

async fn write_frame<W>(writer: &mut W, from: SocketAddr, data: &[u8]) -> VpnResult<()>
where
    W: AsyncWrite + Unpin,
{
    DatagramPacket::from_socket_addr(from, data.to_vec())
        .write_to(writer)
        .await?;
    writer.flush().await?;
    Ok(())
}

async fn stream_to_udp(mut reader: ReadHalf<IoStream>, socket: Arc<UdpSocket>) -> VpnResult<()> {
    let pool = BufferPool::global();
    loop {
        let mut buf = pool.get();
        let (n, addr) = DatagramPacket::read_into(&mut reader, &mut buf).await?;
        let target = match resolve_udp_addr(&addr).await {
            Ok(t) => t,
            Err(e) => {
                log::debug!("[tcp] drop datagram for {}: {}", addr, e);
                continue;
            }
        };
        socket.send_to(&buf[..n], target).await?;
    }
}
