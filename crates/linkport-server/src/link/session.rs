//! The physical connection carried by a link.
//!
//! A [`Session`] owns the protocol handler, the streams and any duplex
//! handler. Exactly one task owns it at a time; hand-offs move it (into the
//! suspend slot, into the select manager, into a resume task) rather than
//! sharing it.

use linkport_core::LifetimeCounters;

use crate::{
    controller::DuplexController,
    io::LinkIo,
    protocol::{DuplexListener, ProtocolConnection, RequestContext},
};

use super::Link;

/// Duplex handler installed by an upgrade.
pub(crate) struct DuplexSession {
    pub(crate) handler: Box<dyn DuplexListener>,
    pub(crate) controller: DuplexController,
}

pub(crate) struct Session {
    pub(crate) conn: Box<dyn ProtocolConnection>,
    pub(crate) io: LinkIo,
    pub(crate) duplex: Option<DuplexSession>,
}

/// Which callback a resumed comet request gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResumeKind {
    Wake,
    Timeout,
}

impl Session {
    pub(crate) fn new(conn: Box<dyn ProtocolConnection>, io: LinkIo) -> Self {
        Self { conn, io, duplex: None }
    }

    /// Split into the handler and the context it is called with.
    pub(crate) fn context<'a>(
        &'a mut self,
        link: &'a std::sync::Arc<Link>,
    ) -> (&'a mut Box<dyn ProtocolConnection>, RequestContext<'a>) {
        (&mut self.conn, RequestContext::new(link, &mut self.io, &mut self.duplex))
    }

    /// Close the socket and notify the handlers.
    ///
    /// Returns the protocol handler so the link can reuse it.
    pub(crate) fn close(mut self, lifetime: &LifetimeCounters) -> Box<dyn ProtocolConnection> {
        if let Some(mut duplex) = self.duplex.take() {
            duplex.handler.on_complete(&duplex.controller);
        }
        self.conn.on_close_connection();
        lifetime.add_bytes(self.io.read_count(), self.io.write_count());
        self.conn
    }
}
