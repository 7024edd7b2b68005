//! DNS over TCP.
//!
//! Every message is prefixed with its length as a 2-byte big-endian
//! integer. One connection carries any number of exchanges, which is what
//! lets a slot keep serving the same server without reconnecting.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{Connector, Transport};

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn open(&self, server: SocketAddr) -> io::Result<TcpTransport> {
        let stream = TcpStream::connect(server).await?;
        stream.set_nodelay(true)?;

        Ok(TcpTransport { stream })
    }
}

pub struct TcpTransport {
    stream: TcpStream,
}

impl Transport for TcpTransport {
    async fn send(&mut self, message: &[u8]) -> io::Result<()> {
        let len = u16::try_from(message.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too long"))?;
        let mut framed = Vec::with_capacity(message.len() + 2);
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(message);

        self.stream.write_all(&framed).await
    }

    async fn receive(&mut self) -> io::Result<Option<Vec<u8>>> {
        read_dns_message(&mut self.stream).await
    }

    async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Read one length-prefixed message. Returns `None` on a clean close
/// between messages.
async fn read_dns_message(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 2];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let msg_len = usize::from(u16::from_be_bytes(prefix));
    let mut buf = vec![0u8; msg_len];
    stream.read_exact(&mut buf).await?;

    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let query = read_dns_message(&mut stream).await.unwrap().unwrap();
            let mut reply = vec![0, query.len() as u8];
            reply.extend_from_slice(&query);
            stream.write_all(&reply).await.unwrap();
        });

        let mut transport = TcpConnector.open(addr).await.unwrap();
        transport.send(b"hello").await.unwrap();

        assert_eq!(transport.receive().await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(transport.receive().await.unwrap(), None);

        transport.close().await;
        server.await.unwrap();
    }
}
