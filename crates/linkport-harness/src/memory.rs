//! In-memory transport.
//!
//! [`memory_transport`] returns an acceptor and a connector sharing an
//! unbounded channel. Each connect creates a `tokio::io::duplex` pair,
//! queues the server half, and returns the client half. Queued
//! connections wait in the channel until an acceptor takes them, like a
//! listen backlog.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::atomic::{AtomicU16, Ordering},
};

use async_trait::async_trait;
use linkport_core::{Acceptor, BoxedSocket};
use tokio::{
    io::DuplexStream,
    sync::{Mutex, mpsc},
};

/// Address the memory acceptor reports as bound.
pub const MEMORY_LOCAL_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080);

type Pending = (DuplexStream, SocketAddr);

/// Server side of the in-memory transport.
#[derive(Debug)]
pub struct MemoryAcceptor {
    incoming: Mutex<mpsc::UnboundedReceiver<Pending>>,
}

/// Client side of the in-memory transport.
#[derive(Debug)]
pub struct MemoryConnector {
    outgoing: mpsc::UnboundedSender<Pending>,
    buffer: usize,
    next_port: AtomicU16,
}

/// Create a connected acceptor/connector pair. `buffer` is the capacity of
/// each duplex pipe.
pub fn memory_transport(buffer: usize) -> (MemoryAcceptor, MemoryConnector) {
    let (outgoing, incoming) = mpsc::unbounded_channel();
    (
        MemoryAcceptor { incoming: Mutex::new(incoming) },
        MemoryConnector { outgoing, buffer, next_port: AtomicU16::new(40_000) },
    )
}

impl MemoryConnector {
    /// Open a connection. The returned stream is the client half.
    ///
    /// # Errors
    ///
    /// `ConnectionRefused` once the acceptor is gone.
    pub fn connect(&self) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(self.buffer);
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let remote_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port);
        self.outgoing
            .send((server, remote_addr))
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(client)
    }
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&self) -> io::Result<(BoxedSocket, SocketAddr)> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some((stream, remote_addr)) => Ok((Box::new(stream), remote_addr)),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "memory connector dropped")),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(MEMORY_LOCAL_ADDR)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn queued_connections_are_accepted_in_order() {
        let (acceptor, connector) = memory_transport(64);
        let mut first = connector.connect().unwrap();
        let _second = connector.connect().unwrap();

        let (mut server, addr1) = acceptor.accept().await.unwrap();
        let (_, addr2) = acceptor.accept().await.unwrap();
        assert!(addr1.port() < addr2.port());

        first.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn accept_fails_once_connector_is_gone() {
        let (acceptor, connector) = memory_transport(64);
        drop(connector);
        let err = acceptor.accept().await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
