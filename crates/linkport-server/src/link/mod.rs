//! Per-connection runtime object.
//!
//! A [`Link`] is allocated once and reused for many physical connections via
//! the listener's free-list. It owns the connection state and the timers;
//! the connection itself (protocol handler plus streams) lives in a session
//! that exactly one task owns at a time.
//!
//! # Ownership and hand-off
//!
//! The request loop runs on a worker task that owns the session. When the
//! loop detaches, the session moves:
//!
//! - comet suspend: into the link's parked slot, and the link into the
//!   listener's suspend set. Whoever removes the link from the suspend set
//!   under the link lock (wake, complete, timeout) wins the right to
//!   schedule the single resume.
//! - select hand-off: into the select manager, which hands it back to a new
//!   worker task when data arrives.
//!
//! The link lock is a plain mutex and is never held across an await. Lock
//! order is link, then listener collections.
//!
//! # Close and destroy
//!
//! [`Link::close`] and [`Link::destroy`] may be called from any task in any
//! state and are idempotent. A parked session is closed in place. A session
//! owned by a worker is aborted: every await of the worker races the link's
//! abort signal, and the worker closes the session on its way out.

mod session;
mod task;

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use linkport_core::{
    ConnectionState, LinkEvent, LinkInfo, SlotAction, StateError, ThrottlePermit,
};
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

pub(crate) use self::{
    session::{DuplexSession, ResumeKind, Session},
    task::accept_task,
};
use crate::{
    controller::{AsyncController, DuplexController},
    error::{FatalEvent, LinkError},
    io::SharedWriteStream,
    listener::Shared,
    protocol::ProtocolConnection,
};

/// What the request loop does after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    Close,
    Keepalive,
    Suspend,
    Duplex,
}

/// Outcome of trying to suspend a comet request.
pub(crate) enum Suspend {
    /// The session is parked and the link is in the suspend set.
    Parked,
    /// A wake or complete arrived first; resume inline.
    Resume(Session),
    /// The link was closed meanwhile.
    Abort(Session),
}

struct LinkCore {
    state: ConnectionState,
    display_state: &'static str,
    remote_addr: Option<SocketAddr>,
    conn: Option<Box<dyn ProtocolConnection>>,
    parked: Option<Session>,
    async_controller: Option<AsyncController>,
    wake_requested: bool,
    complete_requested: bool,
    destroy_requested: bool,
    pending_resume: Option<ResumeKind>,
    idle_time_max: Option<Duration>,
    connection_start: Option<Instant>,
    request_start: Option<Instant>,
    idle_start: Option<Instant>,
    idle_expire: Option<Instant>,
    worker_id: Option<u64>,
    request_url: Option<String>,
    connection_permit: Option<ThrottlePermit>,
    throttle_permit: Option<ThrottlePermit>,
}

impl LinkCore {
    fn new() -> Self {
        Self {
            state: ConnectionState::Init,
            display_state: display_state(ConnectionState::Init),
            remote_addr: None,
            conn: None,
            parked: None,
            async_controller: None,
            wake_requested: false,
            complete_requested: false,
            destroy_requested: false,
            pending_resume: None,
            idle_time_max: None,
            connection_start: None,
            request_start: None,
            idle_start: None,
            idle_expire: None,
            worker_id: None,
            request_url: None,
            connection_permit: None,
            throttle_permit: None,
        }
    }

    /// Clear everything tied to one physical connection.
    fn clear_connection(&mut self) {
        if let Some(controller) = self.async_controller.take() {
            controller.mark_complete();
        }
        self.wake_requested = false;
        self.complete_requested = false;
        self.pending_resume = None;
        self.idle_time_max = None;
        self.connection_start = None;
        self.request_start = None;
        self.idle_start = None;
        self.idle_expire = None;
        self.remote_addr = None;
        self.throttle_permit = None;
    }
}

fn display_state(state: ConnectionState) -> &'static str {
    use ConnectionState as S;

    match state {
        S::Init => "init",
        S::Idle => "idle",
        S::Closed => "closed",
        S::Destroyed => "destroyed",
        S::Accept => "accept",
        S::RequestRead => "read",
        S::RequestActiveKa | S::RequestActiveNka => "active",
        S::RequestKeepalive => "keepalive",
        S::RequestKeepaliveSelect => "select",
        S::CometKa | S::CometNka => "comet",
        S::CometSuspendKa | S::CometSuspendNka => "suspend",
        S::CometCompleteKa | S::CometCompleteNka => "complete",
        S::Duplex => "duplex",
        S::DuplexKeepalive => "duplex-idle",
    }
}

/// A reusable connection slot of a listener.
pub struct Link {
    id: u64,
    shared: Arc<Shared>,
    core: Mutex<LinkCore>,
    generation: AtomicU64,
    abort_requested: AtomicBool,
    abort: Notify,
}

impl Link {
    pub(crate) fn new(id: u64, shared: Arc<Shared>) -> Arc<Self> {
        Arc::new(Self {
            id,
            shared,
            core: Mutex::new(LinkCore::new()),
            generation: AtomicU64::new(0),
            abort_requested: AtomicBool::new(false),
            abort: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LinkCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Id, unique for the listener's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Changes every time the link closes a connection or is reused.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Peer address of the current connection.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.lock().remote_addr
    }

    /// Connection is TLS or the listener is marked secure.
    pub fn is_secure(&self) -> bool {
        self.shared.is_secure()
    }

    /// Worker currently driving the link.
    pub fn worker_id(&self) -> Option<u64> {
        self.lock().worker_id
    }

    /// Diagnostic snapshot.
    pub fn info(&self) -> LinkInfo {
        let core = self.lock();
        LinkInfo {
            id: self.id,
            worker_id: core.worker_id,
            remote_addr: core.remote_addr,
            state: core.state,
            display_state: core.display_state,
            request_active_time: core
                .request_start
                .filter(|_| core.state.is_request_active())
                .map(|start| start.elapsed()),
            request_url: core.request_url.clone(),
            secure: self.shared.is_secure(),
        }
    }

    /// Idle limit for comet suspension or duplex reads.
    pub fn set_idle_time_max(&self, idle: Duration) {
        self.lock().idle_time_max = Some(idle);
    }

    /// Apply one transition and its keepalive-slot action.
    ///
    /// A refused slot allocation turns a dispatch into a non-keepalive
    /// dispatch and leaves any other event unapplied.
    fn transition(
        &self,
        core: &mut LinkCore,
        event: LinkEvent,
    ) -> Result<ConnectionState, StateError> {
        let from = core.state;
        let transition = from.transition(event)?;

        match transition.slot {
            SlotAction::None => {},
            SlotAction::Allocate => {
                if !self.shared.slots.try_allocate(self.shared.config.keepalive_max) {
                    trace!(link_id = self.id, %from, %event, "keepalive slot refused");
                    if matches!(event, LinkEvent::Dispatch { .. }) {
                        return self.transition(core, LinkEvent::Dispatch { keepalive: false });
                    }
                    return Ok(from);
                }
            },
            SlotAction::Release => {
                if !self.shared.slots.release() {
                    error!(link_id = self.id, %from, %event, "keepalive slot released twice");
                }
            },
        }

        core.state = transition.next;
        core.display_state = display_state(transition.next);
        trace!(link_id = self.id, %from, %event, to = %transition.next, "transition");
        Ok(transition.next)
    }

    pub(crate) fn apply(&self, event: LinkEvent) -> Result<ConnectionState, LinkError> {
        let mut core = self.lock();
        Ok(self.transition(&mut core, event)?)
    }

    /// Prepare a pooled link for another accept.
    ///
    /// Returns false if the link can no longer be used.
    pub(crate) fn reset_for_reuse(&self) -> bool {
        let mut core = self.lock();
        if self.transition(&mut core, LinkEvent::Init).is_err() {
            return false;
        }
        core.clear_connection();
        core.destroy_requested = false;
        core.request_url = None;
        core.worker_id = None;
        self.abort_requested.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub(crate) fn attach_connection_permit(&self, permit: ThrottlePermit) {
        self.lock().connection_permit = Some(permit);
    }

    pub(crate) fn client_connected(
        &self,
        remote_addr: SocketAddr,
        permit: ThrottlePermit,
    ) -> Result<(), LinkError> {
        let mut core = self.lock();
        self.transition(&mut core, LinkEvent::ClientConnected)?;
        core.remote_addr = Some(remote_addr);
        core.connection_start = Some(Instant::now());
        core.throttle_permit = Some(permit);
        core.request_url = None;
        Ok(())
    }

    /// Protocol handler kept from the previous connection, or a new one.
    pub(crate) fn take_protocol_connection(&self) -> Box<dyn ProtocolConnection> {
        let kept = self.lock().conn.take();
        kept.unwrap_or_else(|| self.shared.protocol.create_connection(self.id))
    }

    /// Enter request processing, deciding keepalive admission.
    pub(crate) fn dispatch(&self) -> Result<ConnectionState, LinkError> {
        let now = Instant::now();
        let mut core = self.lock();
        let connection_start = *core.connection_start.get_or_insert(now);
        let keepalive = self.shared.keepalive_allowed_for(connection_start, now);

        let state = self.transition(&mut core, LinkEvent::Dispatch { keepalive })?;
        core.request_start = Some(now);
        core.idle_start = None;
        core.idle_expire = None;
        drop(core);

        self.shared.lifetime.add_request();
        Ok(state)
    }

    pub(crate) fn end_request(&self, url: Option<String>) {
        let mut core = self.lock();
        if let Some(start) = core.request_start.take() {
            self.shared.lifetime.add_request_time(start.elapsed());
        }
        core.request_url = url;
    }

    pub(crate) fn start_comet(self: &Arc<Self>) -> Result<AsyncController, LinkError> {
        let mut core = self.lock();
        if core.complete_requested {
            return Err(StateError::IllegalTransition { state: core.state, event: LinkEvent::Comet }
                .into());
        }
        self.transition(&mut core, LinkEvent::Comet)?;

        if let Some(controller) = &core.async_controller {
            return Ok(controller.clone());
        }
        let controller = AsyncController::new(Arc::clone(self), self.generation());
        core.async_controller = Some(controller.clone());
        Ok(controller)
    }

    pub(crate) fn async_controller(&self) -> Option<AsyncController> {
        self.lock().async_controller.clone()
    }

    pub(crate) fn start_duplex(
        self: &Arc<Self>,
        write: &SharedWriteStream,
    ) -> Result<DuplexController, LinkError> {
        let mut core = self.lock();
        self.transition(&mut core, LinkEvent::Duplex)?;
        Ok(DuplexController::new(Arc::clone(self), self.generation(), Arc::clone(write)))
    }

    /// Decide what follows a request, applying the keepalive veto first.
    pub(crate) fn after_request(&self, keepalive: bool, duplex: bool) -> Result<Next, LinkError> {
        let mut core = self.lock();
        if !keepalive {
            self.transition(&mut core, LinkEvent::KillKeepalive)?;
        }
        if duplex {
            return Ok(Next::Duplex);
        }

        let state = core.state;
        if state.is_comet_active() {
            return Ok(Next::Suspend);
        }
        if let Some(controller) = core.async_controller.take() {
            controller.mark_complete();
            core.complete_requested = false;
            core.wake_requested = false;
        }

        if self.is_abort_requested() || !state.is_keepalive_allocated() {
            Ok(Next::Close)
        } else {
            Ok(Next::Keepalive)
        }
    }

    /// Detach the session of a comet request, unless a wake came first.
    pub(crate) fn suspend(self: &Arc<Self>, session: Session) -> Suspend {
        let mut core = self.lock();
        if self.is_abort_requested() {
            return Suspend::Abort(session);
        }
        if core.wake_requested || core.complete_requested {
            core.wake_requested = false;
            return Suspend::Resume(session);
        }
        if let Err(e) = self.transition(&mut core, LinkEvent::CometSuspend) {
            error!(link_id = self.id, error = %e, "cannot suspend");
            return Suspend::Abort(session);
        }

        let now = Instant::now();
        let max = self.shared.config.suspend_time_max;
        let idle = core.idle_time_max.map_or(max, |idle| idle.min(max));
        core.idle_start = Some(now);
        core.idle_expire = Some(now + idle);
        core.parked = Some(session);
        self.shared.insert_suspended(Arc::clone(self));

        debug!(link_id = self.id, ?idle, "comet suspended");
        Suspend::Parked
    }

    /// Take back a suspended session for its scheduled resume.
    pub(crate) fn take_resume(self: &Arc<Self>) -> Option<(Session, ResumeKind)> {
        let mut core = self.lock();
        let kind = core.pending_resume.take()?;
        let session = core.parked.take()?;

        if let Err(e) = self.transition(&mut core, LinkEvent::CometResume) {
            error!(link_id = self.id, error = %e, "cannot resume");
            core.destroy_requested = true;
            drop(core);
            self.finish_connection(Some(session), true);
            self.release();
            return None;
        }
        core.idle_start = None;
        core.idle_expire = None;
        Some((session, kind))
    }

    fn schedule_resume(self: &Arc<Self>) {
        let link = Arc::clone(self);
        if !self.shared.pool.spawn(move |worker_id| task::resume_task(link, worker_id)) {
            trace!(link_id = self.id, "worker pool closed, resume dropped");
        }
    }

    /// Resume a comet request.
    ///
    /// Returns true if a resume is now pending. A wake that arrives while
    /// the handler is still running is remembered and the suspension is
    /// skipped.
    pub fn wake(self: &Arc<Self>) -> bool {
        let mut core = self.lock();
        let state = core.state;

        if state.is_comet_suspend() {
            if let Some(kind) = core.pending_resume {
                return kind == ResumeKind::Wake;
            }
            if !self.shared.remove_suspended(self.id) {
                return false;
            }
            core.pending_resume = Some(ResumeKind::Wake);
            drop(core);
            self.schedule_resume();
            return true;
        }

        if core.async_controller.is_some() && (state.is_comet_active() || state.is_request_active())
        {
            core.wake_requested = true;
            return true;
        }
        false
    }

    /// Complete a comet request.
    ///
    /// # Errors
    ///
    /// Returns an illegal-transition error if no comet request is active.
    pub fn complete(self: &Arc<Self>) -> Result<(), LinkError> {
        let mut core = self.lock();
        let state = core.state;

        if state.is_comet_suspend() {
            core.complete_requested = true;
            if core.pending_resume.is_none() && self.shared.remove_suspended(self.id) {
                core.pending_resume = Some(ResumeKind::Wake);
                drop(core);
                self.schedule_resume();
            }
            return Ok(());
        }

        if state.is_comet_active() || state.is_comet_complete() {
            self.transition(&mut core, LinkEvent::CometComplete)?;
            if let Some(controller) = &core.async_controller {
                controller.mark_complete();
            }
            return Ok(());
        }

        if core.async_controller.is_some() && state.is_request_active() {
            core.complete_requested = true;
            return Ok(());
        }

        let err = StateError::IllegalTransition { state, event: LinkEvent::CometComplete };
        error!(link_id = self.id, error = %err, "complete without a comet request");
        Err(err.into())
    }

    /// Time out a suspended comet request now.
    ///
    /// Returns false if the request is not suspended or a resume is already
    /// pending. A timed-out suspension gets exactly one `handle_timeout`.
    pub fn timeout(self: &Arc<Self>) -> bool {
        self.expire(None)
    }

    pub(crate) fn timeout_if_expired(self: &Arc<Self>, now: Instant) -> bool {
        self.expire(Some(now))
    }

    fn expire(self: &Arc<Self>, now: Option<Instant>) -> bool {
        let mut core = self.lock();
        if !core.state.is_comet_suspend() || core.pending_resume.is_some() {
            return false;
        }
        if let Some(now) = now
            && core.idle_expire.is_some_and(|expire| expire > now)
        {
            return false;
        }
        if !self.shared.remove_suspended(self.id) {
            return false;
        }
        core.pending_resume = Some(ResumeKind::Timeout);
        drop(core);

        debug!(link_id = self.id, "comet timeout");
        self.schedule_resume();
        true
    }

    /// How long a suspended link has been suspended.
    pub(crate) fn suspended_for(&self, now: Instant) -> Option<Duration> {
        let core = self.lock();
        if !core.state.is_comet_suspend() {
            return None;
        }
        core.idle_start.map(|start| now.saturating_duration_since(start))
    }

    /// Non-blocking probe of a parked connection for a closed peer.
    pub fn is_read_eof(&self) -> bool {
        let mut core = self.lock();
        core.parked.as_mut().is_some_and(|session| session.io.is_read_eof())
    }

    /// Enter a keepalive wait. Returns the idle expiry.
    pub(crate) fn begin_keepalive(&self) -> Result<Instant, LinkError> {
        let mut core = self.lock();
        self.transition(&mut core, LinkEvent::Keepalive)?;
        let now = Instant::now();
        let expire = now + self.shared.config.keepalive_timeout;
        core.idle_start = Some(now);
        core.idle_expire = Some(expire);
        drop(core);

        self.shared.lifetime.add_keepalive();
        Ok(expire)
    }

    /// Enter a duplex idle wait. Returns the allowed idle time.
    pub(crate) fn begin_duplex_wait(&self) -> Result<Duration, LinkError> {
        let mut core = self.lock();
        self.transition(&mut core, LinkEvent::Keepalive)?;
        Ok(core.idle_time_max.unwrap_or(self.shared.config.keepalive_timeout))
    }

    /// Count a connection watched by the select manager.
    pub(crate) fn set_selected(&self, selected: bool) {
        let count = &self.shared.keepalive_select_count;
        if selected {
            count.fetch_add(1, Ordering::AcqRel);
        } else {
            count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Continue a readable keepalive connection on a fresh worker.
    pub(crate) fn dispatch_keepalive(self: &Arc<Self>, session: Session) -> bool {
        let link = Arc::clone(self);
        self.shared.pool.spawn(move |worker_id| task::keepalive_task(link, worker_id, session))
    }

    pub(crate) fn idle_expire(&self) -> Option<Instant> {
        self.lock().idle_expire
    }

    /// Close the current connection. The link may be reused.
    pub fn close(self: &Arc<Self>) {
        self.shutdown(false);
    }

    /// Close the current connection and retire the link for good.
    pub fn destroy(self: &Arc<Self>) {
        self.shutdown(true);
    }

    fn shutdown(self: &Arc<Self>, destroy: bool) {
        let mut core = self.lock();
        if destroy {
            core.destroy_requested = true;
        }

        let state = core.state;
        if state.is_destroyed() {
            return;
        }
        if state.is_idle() {
            if destroy && let Err(e) = self.transition(&mut core, LinkEvent::Destroy) {
                error!(link_id = self.id, error = %e, "cannot destroy idle link");
            }
            return;
        }

        // a suspended request is retired here; nobody else owns it
        if let Some(session) = core.parked.take() {
            drop(core);
            self.shared.remove_suspended(self.id);
            self.finish_connection(Some(session), destroy);
            self.release();
            return;
        }
        drop(core);

        self.abort_requested.store(true, Ordering::Release);
        self.abort.notify_waiters();
    }

    pub(crate) fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    /// Run `fut` unless the link is closed or destroyed meanwhile.
    pub(crate) async fn abortable<F: Future>(&self, fut: F) -> Result<F::Output, LinkError> {
        let aborted = self.abort.notified();
        if self.is_abort_requested() {
            return Err(LinkError::Aborted);
        }
        tokio::select! {
            biased;
            () = aborted => Err(LinkError::Aborted),
            out = fut => Ok(out),
        }
    }

    /// Close the session, if any, and move to `Closed` or `Destroyed`.
    pub(crate) fn finish_connection(&self, session: Option<Session>, destroy: bool) {
        let conn = session.map(|session| session.close(&self.shared.lifetime));

        let mut core = self.lock();
        let destroy = destroy || core.destroy_requested;
        if !destroy && conn.is_some() {
            core.conn = conn;
        }
        if core.state.is_comet_suspend() {
            // suspended links must pass through resume before closing
            if let Err(e) = self.transition(&mut core, LinkEvent::CometResume) {
                error!(link_id = self.id, error = %e, "cannot resume suspended link");
            }
        }

        let event = if destroy { LinkEvent::Destroy } else { LinkEvent::Close };
        if let Err(e) = self.transition(&mut core, event) {
            error!(link_id = self.id, error = %e, "cannot close link");
        }
        core.clear_connection();
        self.generation.fetch_add(1, Ordering::AcqRel);
        if !destroy {
            self.abort_requested.store(false, Ordering::Release);
        }
        drop(core);

        self.shared.remove_suspended(self.id);
    }

    /// Return the link to the free-list, or retire it.
    pub(crate) fn release(self: &Arc<Self>) {
        let mut core = self.lock();
        if !core.state.is_closed() && !core.state.is_idle() {
            if core.state.is_comet_suspend()
                && let Err(e) = self.transition(&mut core, LinkEvent::CometResume)
            {
                error!(link_id = self.id, error = %e, "cannot resume suspended link");
            }
            if let Err(e) = self.transition(&mut core, LinkEvent::Close) {
                error!(link_id = self.id, error = %e, "cannot close link for release");
            }
        }

        let pool = core.state.is_allow_idle()
            && !core.destroy_requested
            && !self.shared.lifecycle.is_destroying();
        let event = if pool { LinkEvent::Idle } else { LinkEvent::Destroy };
        if let Err(e) = self.transition(&mut core, event) {
            error!(link_id = self.id, error = %e, "cannot release link");
        }
        core.connection_permit = None;
        core.throttle_permit = None;
        let idle = core.state.is_idle();
        drop(core);

        if idle {
            self.shared.free_link(Arc::clone(self));
        } else {
            self.shared.remove_active(self.id);
        }
        self.shared.wake_manager();
    }

    /// Account a worker task driving this link until the guard drops.
    pub(crate) fn enter_worker(self: &Arc<Self>, worker_id: u64) -> WorkerGuard {
        self.lock().worker_id = Some(worker_id);
        self.shared.thread_count.fetch_add(1, Ordering::AcqRel);
        WorkerGuard { link: Arc::clone(self), worker_id }
    }

    /// Resolve the outcome of a worker run.
    ///
    /// Returns true if the session was handed off and the link must not be
    /// released by this worker. A run that failed before a session existed
    /// still closes the link.
    pub(crate) fn settle(
        self: &Arc<Self>,
        slot: &mut Option<Session>,
        result: std::thread::Result<Result<(), LinkError>>,
    ) -> bool {
        let mut destroy = false;
        let handed_off = matches!(result, Ok(Ok(())));
        match result {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                self.log_error(&e);
                if let LinkError::Fatal(reason) = e {
                    self.shared.publish_fatal(FatalEvent { link_id: self.id, reason });
                    destroy = true;
                }
            },
            Err(payload) => {
                warn!(
                    link_id = self.id,
                    panic = %panic_message(payload.as_ref()),
                    "protocol handler panicked"
                );
                destroy = true;
            },
        }

        match slot.take() {
            Some(session) => {
                self.finish_connection(Some(session), destroy);
                false
            },
            None if handed_off => true,
            None => {
                self.finish_connection(None, destroy);
                false
            },
        }
    }

    fn log_error(&self, e: &LinkError) {
        let link_id = self.id;
        if e.is_client_disconnect() {
            self.shared.lifetime.add_client_disconnect();
        }
        if self.shared.lifecycle.is_destroying() {
            trace!(link_id, error = %e, "link error during listener close");
            return;
        }

        match e {
            e if e.is_client_disconnect() => trace!(link_id, error = %e, "client disconnect"),
            LinkError::Io(_) => debug!(link_id, error = %e, "connection i/o error"),
            LinkError::Aborted => debug!(link_id, "link aborted"),
            LinkError::State(_) | LinkError::Busy(_) => error!(link_id, error = %e, "link defect"),
            LinkError::Fatal(_) => error!(link_id, error = %e, "fatal link error"),
        }
    }
}

/// Worker accounting for one task run.
pub(crate) struct WorkerGuard {
    link: Arc<Link>,
    worker_id: u64,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.link.shared.thread_count.fetch_sub(1, Ordering::AcqRel);
        let mut core = self.link.lock();
        if core.worker_id == Some(self.worker_id) {
            core.worker_id = None;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
