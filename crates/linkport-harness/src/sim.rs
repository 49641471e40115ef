//! Acceptor over turmoil's simulated network.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use linkport_core::{Acceptor, BoxedSocket};
use turmoil::net::TcpListener;

/// Accepts simulated TCP connections inside a turmoil host.
pub struct SimAcceptor {
    listener: TcpListener,
}

impl SimAcceptor {
    /// Bind inside the current turmoil host, e.g. `"0.0.0.0:8080"`.
    ///
    /// # Errors
    ///
    /// Returns the bind error, e.g. when the port is taken.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl Acceptor for SimAcceptor {
    async fn accept(&self) -> io::Result<(BoxedSocket, SocketAddr)> {
        let (stream, remote_addr) = self.listener.accept().await?;
        Ok((Box::new(stream), remote_addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
