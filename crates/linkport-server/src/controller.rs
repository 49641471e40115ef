//! Handles given to application code.
//!
//! A controller is bound to one physical connection of a link. When the
//! connection closes, or the link is reused for another socket, the link's
//! generation moves on and every operation on an old controller becomes a
//! no-op.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::{error::LinkError, io::SharedWriteStream, link::Link};

struct Binding {
    link: Arc<Link>,
    generation: u64,
    complete: AtomicBool,
    closed: AtomicBool,
}

impl Binding {
    fn new(link: Arc<Link>, generation: u64) -> Arc<Self> {
        Arc::new(Self {
            link,
            generation,
            complete: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn is_current(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.link.generation() == self.generation
    }
}

/// Handle to a comet (long-poll) request.
#[derive(Clone)]
pub struct AsyncController {
    binding: Arc<Binding>,
}

impl AsyncController {
    pub(crate) fn new(link: Arc<Link>, generation: u64) -> Self {
        Self { binding: Binding::new(link, generation) }
    }

    /// Id of the link.
    pub fn link_id(&self) -> u64 {
        self.binding.link.id()
    }

    /// Longest time the request may stay suspended, capped by
    /// `suspend-time-max`. Applies from the next suspension.
    pub fn set_max_idle_time(&self, idle: Duration) {
        if self.binding.is_current() {
            self.binding.link.set_idle_time_max(idle);
        }
    }

    /// Resume the request. Returns false if it cannot be resumed.
    ///
    /// A wake that arrives before the handler returns is remembered and the
    /// suspension is skipped.
    pub fn wake(&self) -> bool {
        self.binding.is_current() && self.binding.link.wake()
    }

    /// Finish the request.
    ///
    /// A suspended request is resumed once so the protocol can write its
    /// final response.
    ///
    /// # Errors
    ///
    /// Returns an illegal-transition error if the link is not in a comet
    /// request.
    pub fn complete(&self) -> Result<(), LinkError> {
        if !self.binding.is_current() {
            return Ok(());
        }
        self.binding.link.complete()
    }

    /// Close the connection.
    pub fn close(&self) {
        if self.binding.is_current() {
            self.binding.closed.store(true, Ordering::Release);
            self.binding.link.close();
        }
    }

    /// The request completed, closed, or the connection is gone.
    pub fn is_complete(&self) -> bool {
        self.binding.complete.load(Ordering::Acquire) || !self.binding.is_current()
    }

    pub(crate) fn mark_complete(&self) {
        self.binding.complete.store(true, Ordering::Release);
    }
}

impl fmt::Debug for AsyncController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncController")
            .field("link_id", &self.link_id())
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Handle to an upgraded, full-duplex connection.
///
/// The controller carries no read accessor. The link's worker owns the
/// read side and lends it to [`crate::DuplexListener::on_read`] each time
/// data arrives, so a duplex handler reads only inside that callback.
/// Writes go through [`DuplexController::write_stream`] from any task, and
/// concurrent writers serialize on its lock.
#[derive(Clone)]
pub struct DuplexController {
    binding: Arc<Binding>,
    write: SharedWriteStream,
}

impl DuplexController {
    pub(crate) fn new(link: Arc<Link>, generation: u64, write: SharedWriteStream) -> Self {
        Self { binding: Binding::new(link, generation), write }
    }

    /// Id of the link.
    pub fn link_id(&self) -> u64 {
        self.binding.link.id()
    }

    /// Shared write side of the connection.
    pub fn write_stream(&self) -> SharedWriteStream {
        Arc::clone(&self.write)
    }

    /// Idle time allowed between reads.
    pub fn set_idle_time_max(&self, idle: Duration) {
        if self.binding.is_current() {
            self.binding.link.set_idle_time_max(idle);
        }
    }

    /// Close the connection.
    pub fn close(&self) {
        if self.binding.is_current() {
            self.binding.closed.store(true, Ordering::Release);
            self.binding.link.close();
        }
    }

    /// The connection is closed.
    pub fn is_closed(&self) -> bool {
        !self.binding.is_current()
    }
}

impl fmt::Debug for DuplexController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexController")
            .field("link_id", &self.link_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
