//! Tunnel data plane: node addressing, dialing, framing, and handlers.

pub mod buffer;
pub mod chain;
pub mod datagram;
pub mod handler;
pub mod node;
pub mod packet;
pub mod packet_conn;
pub mod server;
pub mod tcp_handler;
pub mod tls;
pub mod transport;
pub mod tun_handler;

pub use chain::Chain;
pub use datagram::DatagramPacket;
pub use handler::{Accepted, Handler, HandlerOptions};
pub use node::Node;
pub use server::{Listener, Server};
pub use transport::{Client, Conn, IoStream};
