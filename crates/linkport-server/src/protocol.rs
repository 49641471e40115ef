//! Protocol contracts.
//!
//! The engine knows nothing about wire formats. A [`Protocol`] creates one
//! [`ProtocolConnection`] per link; the link reuses it for every physical
//! connection it carries and calls it once per request. Everything a
//! handler may touch is passed explicitly in a [`RequestContext`]: the
//! streams, the link, and the comet and duplex entry points.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use linkport_core::{ConnectionState, LinkEvent};
use tokio::sync::MutexGuard;

use crate::{
    controller::{AsyncController, DuplexController},
    error::LinkError,
    io::{LinkIo, ReadStream, WriteStream},
    link::{DuplexSession, Link},
};

/// Factory for per-link protocol handlers.
pub trait Protocol: Send + Sync + 'static {
    /// Create the handler for a new link.
    fn create_connection(&self, link_id: u64) -> Box<dyn ProtocolConnection>;

    /// Protocol name, used as the scheme of the listener URL.
    fn protocol_name(&self) -> &str;
}

/// Per-link request handler.
///
/// `init` and `on_start_connection` run for every accepted socket, then
/// `handle_request` runs once per request. `on_close_connection` runs
/// exactly once when the socket is closed.
#[async_trait]
pub trait ProtocolConnection: Send + 'static {
    /// Reset per-connection state.
    fn init(&mut self) {}

    /// A socket was accepted.
    fn on_start_connection(&mut self) {}

    /// Handle one request.
    ///
    /// Returns whether the connection may be kept alive. A handler may
    /// start a comet request or a duplex upgrade through `ctx` before
    /// returning.
    async fn handle_request(&mut self, ctx: &mut RequestContext<'_>) -> io::Result<bool>;

    /// Continue a comet request after a wake.
    async fn handle_resume(&mut self, ctx: &mut RequestContext<'_>) -> io::Result<bool> {
        let _ = ctx;
        Ok(false)
    }

    /// A suspended comet request expired. Called at most once per suspension,
    /// and never together with `handle_resume` for the same suspension.
    async fn handle_timeout(&mut self, ctx: &mut RequestContext<'_>) -> io::Result<bool> {
        let _ = ctx;
        Ok(false)
    }

    /// The socket was closed.
    fn on_close_connection(&mut self) {}

    /// URL of the current request, for diagnostics.
    fn protocol_request_url(&self) -> Option<String> {
        None
    }
}

/// Handler of an upgraded, full-duplex connection.
#[async_trait]
pub trait DuplexListener: Send + 'static {
    /// The upgrade took effect.
    fn on_start(&mut self, controller: &DuplexController) {
        let _ = controller;
    }

    /// Data is available on `read`.
    ///
    /// This is the only place a duplex handler sees the read stream. The
    /// handler must consume at least one byte; a read that consumes
    /// nothing closes the connection.
    async fn on_read(
        &mut self,
        controller: &DuplexController,
        read: &mut ReadStream,
    ) -> io::Result<()>;

    /// The connection closed.
    fn on_complete(&mut self, controller: &DuplexController) {
        let _ = controller;
    }
}

/// Explicit per-request context handed to protocol code.
pub struct RequestContext<'a> {
    link: &'a Arc<Link>,
    io: &'a mut LinkIo,
    duplex: &'a mut Option<DuplexSession>,
}

impl<'a> RequestContext<'a> {
    pub(crate) fn new(
        link: &'a Arc<Link>,
        io: &'a mut LinkIo,
        duplex: &'a mut Option<DuplexSession>,
    ) -> Self {
        Self { link, io, duplex }
    }

    /// Link carrying the request.
    pub fn link(&self) -> &Arc<Link> {
        self.link
    }

    /// Id of the link.
    pub fn link_id(&self) -> u64 {
        self.link.id()
    }

    /// Peer address.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.link.remote_addr()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Connection is TLS or marked secure.
    pub fn is_secure(&self) -> bool {
        self.link.is_secure()
    }

    /// Request input.
    pub fn read_stream(&mut self) -> &mut ReadStream {
        self.io.read_stream()
    }

    /// Response output. Flushed by the runtime when the request ends.
    pub async fn write_stream(&mut self) -> MutexGuard<'_, WriteStream> {
        self.io.write_stream().lock().await
    }

    /// Forbid keepalive for this request.
    pub fn kill_keepalive(&mut self) -> Result<(), LinkError> {
        self.link.apply(LinkEvent::KillKeepalive).map(|_| ())
    }

    /// Turn this request into a comet request.
    ///
    /// The runtime suspends the link when the handler returns, unless the
    /// controller was woken first. Starting comet again from
    /// `handle_resume` keeps the same controller.
    pub fn start_comet(&mut self) -> Result<AsyncController, LinkError> {
        self.link.start_comet()
    }

    /// Controller of the comet request being resumed, if any.
    pub fn async_controller(&self) -> Option<AsyncController> {
        self.link.async_controller()
    }

    /// Upgrade the connection to duplex.
    ///
    /// After the handler returns, reads are driven by `handler` instead of
    /// the request loop. The upgrade releases any keepalive slot.
    pub fn start_duplex(
        &mut self,
        mut handler: Box<dyn DuplexListener>,
    ) -> Result<DuplexController, LinkError> {
        let controller = self.link.start_duplex(self.io.write_stream())?;
        handler.on_start(&controller);
        *self.duplex = Some(DuplexSession { handler, controller: controller.clone() });
        Ok(controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn require_send<F: Send>(_: &F) {}

    fn write_stream_future_is_send(ctx: &mut RequestContext<'_>) {
        let write = ctx.write_stream();
        require_send(&write);
    }

    #[test]
    fn request_context_futures_can_cross_tasks() {
        // compile-time check: worker tasks require Send futures
        let check: fn(&mut RequestContext<'_>) = write_stream_future_is_send;
        let _ = check;
    }
}
