//! Transport contracts.
//!
//! The engine never opens sockets itself. An [`Acceptor`] hands it
//! connected byte streams; production uses a TCP acceptor, tests use an
//! in-memory one or a turmoil-simulated network. An optional
//! [`TlsFactory`] wraps each accepted stream before any protocol code sees
//! it.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A connected, bidirectional byte stream.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased socket carried by a link.
pub type BoxedSocket = Box<dyn Socket>;

/// Source of accepted connections.
///
/// Several acceptors may wait in [`Acceptor::accept`] at once; each call
/// yields one connection.
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    /// Wait for the next connection.
    ///
    /// Returns the stream and the peer address.
    async fn accept(&self) -> io::Result<(BoxedSocket, SocketAddr)>;

    /// Address the acceptor is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Best-effort nudge for up to `count` tasks parked in accept.
    ///
    /// Used on close so no acceptor stays blocked in a call the runtime
    /// cannot cancel. The default does nothing.
    async fn wake_acceptors(&self, count: usize) {
        let _ = count;
    }
}

/// Wraps accepted sockets in a secure channel.
#[async_trait]
pub trait TlsFactory: Send + Sync + 'static {
    /// Perform the server-side handshake on `socket`.
    async fn wrap(&self, socket: BoxedSocket) -> io::Result<BoxedSocket>;
}
