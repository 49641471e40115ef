//! Keepalive select manager.
//!
//! A worker serving a keepalive connection waits only briefly for the next
//! request. If nothing arrives it offers the connection to the select
//! manager, which watches it without holding a worker and hands it back to a
//! fresh worker task when data arrives.
//!
//! The manager contract is three moves on a [`KeepaliveHandoff`]:
//!
//! 1. [`KeepaliveHandoff::register`] moves the link to
//!    `REQUEST_KEEPALIVE_SELECT` and yields a [`SelectedLink`].
//! 2. [`SelectedLink::wait_readable`] waits for data, EOF, or the keepalive
//!    expiry.
//! 3. [`SelectedLink::dispatch`] hands a readable connection back to the
//!    worker pool; [`SelectedLink::close`] (or dropping it) closes it.
//!
//! Declining a hand-off returns it unchanged; the worker then falls back to a
//! blocking read.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use linkport_core::LinkEvent;
use tracing::{debug, trace};

use crate::{
    error::LinkError,
    io::ReadReady,
    link::{Link, Session},
};

/// Watches idle keepalive connections without holding workers.
pub trait SelectManager: Send + Sync + 'static {
    /// Start the manager. Returns false if it cannot run; keepalive waits
    /// then stay on their workers.
    fn start(&self) -> bool;

    /// Take over an idle keepalive connection.
    ///
    /// An accepted hand-off must be registered; dropping it leaks the link
    /// until the listener closes.
    ///
    /// # Errors
    ///
    /// Returns the hand-off unchanged if the manager declines it.
    fn keepalive(&self, handoff: KeepaliveHandoff) -> Result<(), KeepaliveHandoff>;

    /// Decline further hand-offs. Watched connections are kept.
    fn stop(&self);

    /// Decline further hand-offs and close every watched connection.
    fn close(&self);
}

/// An idle keepalive connection offered to a [`SelectManager`].
pub struct KeepaliveHandoff {
    link: Arc<Link>,
    session: Session,
}

impl KeepaliveHandoff {
    pub(crate) fn new(link: Arc<Link>, session: Session) -> Self {
        Self { link, session }
    }

    pub(crate) fn into_session(self) -> Session {
        self.session
    }

    /// The link being handed off.
    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// Accept the hand-off.
    ///
    /// # Errors
    ///
    /// Fails if the link left keepalive meanwhile; the connection is then
    /// closed.
    pub fn register(self) -> Result<SelectedLink, LinkError> {
        let Self { link, session } = self;
        if let Err(e) = link.apply(LinkEvent::KeepaliveSelect) {
            link.finish_connection(Some(session), false);
            link.release();
            return Err(e);
        }

        link.set_selected(true);
        Ok(SelectedLink { link, session: Some(session) })
    }
}

/// A keepalive connection held by a select manager.
///
/// Dropping it without dispatching closes the connection.
pub struct SelectedLink {
    link: Arc<Link>,
    session: Option<Session>,
}

impl SelectedLink {
    /// The watched link.
    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// Wait until the peer sends data, closes, or the keepalive expires.
    ///
    /// # Errors
    ///
    /// Returns `Aborted` if the link is closed meanwhile, or the read error.
    pub async fn wait_readable(&mut self) -> Result<ReadReady, LinkError> {
        let session = self.session.as_mut().ok_or(LinkError::Busy(self.link.id()))?;
        let wait = self
            .link
            .idle_expire()
            .map_or(Duration::ZERO, |expire| expire.saturating_duration_since(Instant::now()));
        Ok(self.link.abortable(session.io.wait_readable(wait)).await??)
    }

    /// Hand the connection back to a worker for its next request.
    ///
    /// Returns false if the worker pool is closed; the connection is closed.
    pub fn dispatch(mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };
        let dispatched = self.link.dispatch_keepalive(session);
        if !dispatched {
            self.link.finish_connection(None, false);
            self.link.release();
        }
        dispatched
    }

    /// Close the connection.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for SelectedLink {
    fn drop(&mut self) {
        self.link.set_selected(false);
        if let Some(session) = self.session.take() {
            self.link.finish_connection(Some(session), false);
            self.link.release();
        }
    }
}

/// Select manager built on the tokio reactor.
///
/// Each watched connection is a lightweight reactor task rather than a
/// worker. At most `max` connections are watched at once.
pub struct ReactorSelectManager {
    max: usize,
    running: AtomicBool,
    closed: AtomicBool,
    watched: Arc<Mutex<HashMap<u64, Arc<Link>>>>,
}

impl ReactorSelectManager {
    /// Manager watching at most `max` connections.
    pub fn new(max: usize) -> Self {
        Self {
            max,
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            watched: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Connections currently watched.
    pub fn watched(&self) -> usize {
        lock(&self.watched).len()
    }
}

impl SelectManager for ReactorSelectManager {
    fn start(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.running.store(true, Ordering::Release);
        true
    }

    fn keepalive(&self, handoff: KeepaliveHandoff) -> Result<(), KeepaliveHandoff> {
        if !self.running.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return Err(handoff);
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return Err(handoff);
        };

        let id = handoff.link().id();
        {
            let mut watched = lock(&self.watched);
            if watched.len() >= self.max {
                trace!(link_id = id, max = self.max, "select manager full");
                return Err(handoff);
            }
            watched.insert(id, Arc::clone(handoff.link()));
        }

        let watched = Arc::clone(&self.watched);
        runtime.spawn(watch(handoff, watched));
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);

        let links: Vec<Arc<Link>> = lock(&self.watched).values().cloned().collect();
        for link in links {
            link.close();
        }
    }
}

async fn watch(handoff: KeepaliveHandoff, watched: Arc<Mutex<HashMap<u64, Arc<Link>>>>) {
    let id = handoff.link().id();
    let mut selected = match handoff.register() {
        Ok(selected) => selected,
        Err(e) => {
            lock(&watched).remove(&id);
            debug!(link_id = id, error = %e, "select registration failed");
            return;
        },
    };

    let ready = selected.wait_readable().await;
    lock(&watched).remove(&id);

    match ready {
        Ok(ReadReady::Data) => {
            if !selected.dispatch() {
                trace!(link_id = id, "worker pool closed, keepalive dropped");
            }
        },
        Ok(ready) => {
            trace!(link_id = id, ?ready, "selected keepalive ended");
            selected.close();
        },
        Err(e) => {
            trace!(link_id = id, error = %e, "selected keepalive aborted");
            selected.close();
        },
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
