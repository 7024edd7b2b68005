//! DNS over UDP.
//!
//! A connected datagram socket per transport, so the kernel drops replies
//! from anyone but the server. Only suitable for single-message answers;
//! zone transfers need TCP.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;

use super::{Connector, MAX_DNS_PACKET_SIZE, Transport};

#[derive(Debug, Clone, Copy, Default)]
pub struct UdpConnector;

impl Connector for UdpConnector {
    type Transport = UdpTransport;

    async fn open(&self, server: SocketAddr) -> io::Result<UdpTransport> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;

        Ok(UdpTransport { socket })
    }
}

pub struct UdpTransport {
    socket: UdpSocket,
}

impl Transport for UdpTransport {
    async fn send(&mut self, message: &[u8]) -> io::Result<()> {
        let sent = self.socket.send(message).await?;
        if sent != message.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short datagram send"));
        }
        Ok(())
    }

    async fn receive(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
        let len = self.socket.recv(&mut buf).await?;
        buf.truncate(len);

        Ok(Some(buf))
    }

    async fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datagrams_reach_connected_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut transport = UdpConnector.open(addr).await.unwrap();
        transport.send(b"query").await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"query");
        server.send_to(b"answer", from).await.unwrap();

        assert_eq!(transport.receive().await.unwrap(), Some(b"answer".to_vec()));
    }
}
