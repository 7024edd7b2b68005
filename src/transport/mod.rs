//! Client transports.
//!
//! A [`Connector`] opens one [`Transport`] per logical connection. A
//! transport is used by exactly one worker at a time and is never shared.

pub mod tcp;
pub mod udp;

#[cfg(test)]
pub(crate) mod mock;

use std::future::Future;
use std::io;
use std::net::SocketAddr;

pub use tcp::TcpConnector;
pub use udp::UdpConnector;

/// Maximum size of a DNS message over UDP (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// One open connection to a name server.
pub trait Transport: Send + 'static {
    /// Send one complete DNS message.
    fn send(&mut self, message: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Wait for the next complete DNS message. `None` means the server
    /// closed the connection.
    fn receive(&mut self) -> impl Future<Output = io::Result<Option<Vec<u8>>>> + Send;

    /// Close the connection.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Opens transports to name servers.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn open(&self, server: SocketAddr) -> impl Future<Output = io::Result<Self::Transport>> + Send;
}
