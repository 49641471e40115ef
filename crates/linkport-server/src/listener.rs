//! Listener: the accept side of the engine.
//!
//! A [`Listener`] owns the listening acceptor and every [`Link`] created for
//! it. Links live in one of three places:
//!
//! - the active set: links with a connection or an acceptor task
//! - the suspend set: the subset of active links parked in comet suspend
//! - the free-list: idle links kept for reuse, bounded by
//!   `free-list-capacity`
//!
//! # Acceptors
//!
//! An acceptor is a worker task driving a link through `ACCEPT`. The
//! listener keeps at least `accept-thread-min` acceptors starting or idle
//! and lets at most `accept-thread-max` of them wait in accept at once. A
//! manager task tops the acceptors up whenever a link is released or an
//! acceptor picks up a connection.
//!
//! # Lifecycle
//!
//! `bind`, then `start`. `stop` parks the accept side without touching
//! established connections; `start` again resumes it. `close` destroys
//! every link, closes the select manager and the worker pool, and is
//! terminal.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use linkport_core::{
    Acceptor, BoxedSocket, KeepalivePolicy, KeepaliveSlots, Lifecycle, LifecycleState,
    LifetimeCounters, LinkEvent, LinkInfo, ListenerConfig, ListenerStats, Throttle,
    ThrottlePermit, TlsFactory,
};
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::{FatalEvent, ListenerError},
    link::{Link, accept_task},
    pool::WorkerPool,
    protocol::Protocol,
    reaper,
    select::SelectManager,
    tcp::TcpAcceptor,
};

/// How long `close` waits for links to finish.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a non-transient accept failure.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Extra nudges on close for acceptors that raced the count.
const WAKE_ACCEPTOR_SLACK: usize = 10;

/// One accepted connection.
pub(crate) struct Accepted {
    pub(crate) socket: BoxedSocket,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) permit: ThrottlePermit,
}

/// State shared by the listener, its links and its background tasks.
pub(crate) struct Shared {
    pub(crate) config: ListenerConfig,
    url: String,
    pub(crate) protocol: Arc<dyn Protocol>,
    pub(crate) tls: Option<Arc<dyn TlsFactory>>,
    select: Option<Arc<dyn SelectManager>>,
    select_enabled: AtomicBool,
    acceptor: Mutex<Option<Arc<dyn Acceptor>>>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) slots: KeepaliveSlots,
    keepalive_policy: KeepalivePolicy,
    throttle: Throttle,
    connections: Throttle,
    pub(crate) lifetime: LifetimeCounters,
    pub(crate) pool: WorkerPool,
    next_link_id: AtomicU64,
    free_list: Mutex<Vec<Arc<Link>>>,
    active: Mutex<HashMap<u64, Arc<Link>>>,
    suspended: Mutex<HashMap<u64, Arc<Link>>>,
    idle_threads: AtomicUsize,
    pub(crate) start_threads: AtomicUsize,
    pub(crate) thread_count: AtomicUsize,
    pub(crate) keepalive_threads: AtomicUsize,
    pub(crate) keepalive_select_count: AtomicUsize,
    manager_wake: Notify,
    accept_gate: Notify,
    drained: Notify,
    fatal: watch::Sender<Option<FatalEvent>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Decrements the idle acceptor count when an acceptor leaves accept.
struct IdleGuard<'a>(&'a AtomicUsize);

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Shared {
    pub(crate) fn is_secure(&self) -> bool {
        self.tls.is_some() || self.config.secure
    }

    fn current_acceptor(&self) -> Option<Arc<dyn Acceptor>> {
        lock(&self.acceptor).clone()
    }

    /// Claim one of the `accept-thread-max` idle places.
    fn enter_idle(&self) -> Option<IdleGuard<'_>> {
        let max = self.config.accept_thread_max;
        self.idle_threads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |idle| (idle < max).then_some(idle + 1))
            .ok()
            .map(|_| IdleGuard(&self.idle_threads))
    }

    /// Wait for the next connection on behalf of `link`.
    ///
    /// Returns `None` when the link should leave the accept loop: the
    /// listener stopped, enough acceptors are idle, or the link was closed.
    pub(crate) async fn accept(&self, link: &Arc<Link>) -> Option<Accepted> {
        let stopped = self.accept_gate.notified();
        tokio::pin!(stopped);
        if !self.lifecycle.is_active() || link.is_abort_requested() {
            return None;
        }

        let _idle = self.enter_idle()?;
        if let Err(e) = link.apply(LinkEvent::Accept) {
            error!(link_id = link.id(), error = %e, "cannot enter accept");
            return None;
        }
        let acceptor = self.current_acceptor()?;
        // an idle acceptor frees a start slot
        self.wake_manager();

        loop {
            if !self.lifecycle.is_active() {
                return None;
            }
            let result = tokio::select! {
                biased;
                () = &mut stopped => return None,
                result = link.abortable(self.admit_and_accept(acceptor.as_ref())) => result,
            };

            match result {
                Err(_) => return None,
                Ok(Ok(accepted)) => return Some(accepted),
                Ok(Err(e)) if is_transient_accept_error(&e) => {
                    trace!(listener = %self.url, error = %e, "transient accept error");
                },
                Ok(Err(e)) => {
                    if self.lifecycle.is_destroying() {
                        trace!(listener = %self.url, error = %e, "accept failed during close");
                        return None;
                    }
                    warn!(listener = %self.url, error = %e, "accept failed");
                    tokio::select! {
                        biased;
                        () = &mut stopped => return None,
                        () = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {},
                    }
                },
            }
        }
    }

    async fn admit_and_accept(&self, acceptor: &dyn Acceptor) -> io::Result<Accepted> {
        let Some(permit) = self.throttle.admit().await else {
            return Err(io::Error::other("connection throttle closed"));
        };
        let (socket, remote_addr) = acceptor.accept().await?;
        Ok(Accepted { socket, remote_addr, permit })
    }

    /// A reset link from the free-list, or a new one. The link joins the
    /// active set.
    fn allocate_link(self: &Arc<Self>) -> Arc<Link> {
        loop {
            let pooled = lock(&self.free_list).pop();
            let Some(link) = pooled else { break };
            if link.reset_for_reuse() {
                lock(&self.active).insert(link.id(), Arc::clone(&link));
                return link;
            }
        }

        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let link = Link::new(id, Arc::clone(self));
        lock(&self.active).insert(id, Arc::clone(&link));
        link
    }

    /// Start acceptors until `accept-thread-min` are starting or idle.
    fn start_acceptors(self: &Arc<Self>) {
        while self.lifecycle.is_active() {
            let starting = self.start_threads.load(Ordering::Acquire);
            let idle = self.idle_threads.load(Ordering::Acquire);
            if starting + idle >= self.config.accept_thread_min {
                break;
            }
            let Some(permit) = self.connections.try_admit() else {
                debug!(listener = %self.url, max = self.config.connection_max, "connection-max reached");
                break;
            };

            let link = self.allocate_link();
            link.attach_connection_permit(permit);
            self.start_threads.fetch_add(1, Ordering::AcqRel);

            let task_link = Arc::clone(&link);
            if !self.pool.spawn(move |worker_id| accept_task(task_link, worker_id)) {
                self.start_threads.fetch_sub(1, Ordering::AcqRel);
                link.release();
                break;
            }
            trace!(listener = %self.url, link_id = link.id(), "acceptor started");
        }
    }

    /// Stopped and closing listeners keep no connection alive.
    pub(crate) fn keepalive_allowed_for(&self, connection_start: Instant, now: Instant) -> bool {
        self.lifecycle.is_active()
            && self.keepalive_policy.allows(&self.slots, connection_start, now)
    }

    pub(crate) fn select_for_keepalive(&self) -> Option<Arc<dyn SelectManager>> {
        if !self.select_enabled.load(Ordering::Acquire) {
            return None;
        }
        self.select.clone()
    }

    pub(crate) fn insert_suspended(&self, link: Arc<Link>) {
        lock(&self.suspended).insert(link.id(), link);
    }

    pub(crate) fn remove_suspended(&self, id: u64) -> bool {
        lock(&self.suspended).remove(&id).is_some()
    }

    pub(crate) fn suspended_snapshot(&self) -> Vec<Arc<Link>> {
        lock(&self.suspended).values().cloned().collect()
    }

    /// Move an idle link from the active set to the free-list.
    pub(crate) fn free_link(&self, link: Arc<Link>) {
        self.remove_active(link.id());

        let overflow = {
            let mut free_list = lock(&self.free_list);
            if free_list.len() < self.config.free_list_capacity && !self.lifecycle.is_destroying() {
                free_list.push(link);
                None
            } else {
                Some(link)
            }
        };
        if let Some(link) = overflow {
            link.destroy();
        }
    }

    pub(crate) fn remove_active(&self, id: u64) {
        let mut active = lock(&self.active);
        active.remove(&id);
        if active.is_empty() {
            self.drained.notify_waiters();
        }
    }

    pub(crate) fn wake_manager(&self) {
        self.manager_wake.notify_one();
    }

    pub(crate) fn publish_fatal(&self, event: FatalEvent) {
        error!(listener = %self.url, link_id = event.link_id, reason = %event.reason, "fatal error");
        self.fatal.send_replace(Some(event));
    }

    fn active_snapshot(&self) -> Vec<Arc<Link>> {
        lock(&self.active).values().cloned().collect()
    }
}

/// Keeps the acceptor count topped up.
async fn manage(shared: Arc<Shared>) {
    loop {
        let wake = shared.manager_wake.notified();
        if shared.lifecycle.is_destroying() {
            break;
        }
        if shared.lifecycle.is_active() {
            shared.start_acceptors();
        }
        wake.await;
    }
    trace!(listener = %shared.url, "manager stopped");
}

/// Builds a [`Listener`].
pub struct ListenerBuilder {
    config: ListenerConfig,
    protocol: Arc<dyn Protocol>,
    tls: Option<Arc<dyn TlsFactory>>,
    select: Option<Arc<dyn SelectManager>>,
}

impl ListenerBuilder {
    /// Wrap every accepted socket with `tls`. The listener reports secure.
    pub fn tls(mut self, tls: Arc<dyn TlsFactory>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Hand idle keepalive connections to `select`.
    pub fn select_manager(mut self, select: Arc<dyn SelectManager>) -> Self {
        self.select = Some(select);
        self
    }

    /// Validate the configuration and create the listener.
    pub fn build(self) -> Result<Listener, ListenerError> {
        let Self { config, protocol, tls, select } = self;
        config.validate()?;

        let url = config.url(protocol.protocol_name());
        let (fatal, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            url,
            protocol,
            tls,
            select,
            select_enabled: AtomicBool::new(false),
            acceptor: Mutex::new(None),
            lifecycle: Lifecycle::new(),
            slots: KeepaliveSlots::new(),
            keepalive_policy: KeepalivePolicy {
                max: config.keepalive_max,
                connection_time_max: config.keepalive_connection_time_max,
            },
            throttle: Throttle::new(config.throttle_concurrent_max),
            connections: Throttle::new(Some(config.connection_max)),
            lifetime: LifetimeCounters::default(),
            pool: WorkerPool::new(config.worker_max),
            next_link_id: AtomicU64::new(1),
            free_list: Mutex::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
            suspended: Mutex::new(HashMap::new()),
            idle_threads: AtomicUsize::new(0),
            start_threads: AtomicUsize::new(0),
            thread_count: AtomicUsize::new(0),
            keepalive_threads: AtomicUsize::new(0),
            keepalive_select_count: AtomicUsize::new(0),
            manager_wake: Notify::new(),
            accept_gate: Notify::new(),
            drained: Notify::new(),
            fatal,
            config,
        });

        Ok(Listener { shared, tasks: Mutex::new(Vec::new()) })
    }
}

/// Accepts connections and drives them through their lifecycle.
pub struct Listener {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Listener {
    /// Start building a listener serving `protocol`.
    pub fn builder(config: ListenerConfig, protocol: Arc<dyn Protocol>) -> ListenerBuilder {
        ListenerBuilder { config, protocol, tls: None, select: None }
    }

    /// Debug URL, `<protocol>://<address|*>:<port>`.
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Listener configuration.
    pub fn config(&self) -> &ListenerConfig {
        &self.shared.config
    }

    /// TLS is configured or the listener is marked secure.
    pub fn is_secure(&self) -> bool {
        self.shared.is_secure()
    }

    /// Open a TCP socket on the configured address and port.
    ///
    /// A listener that is already bound keeps its socket and returns its
    /// address. Must be called from within a tokio runtime.
    pub fn bind(&self) -> Result<SocketAddr, ListenerError> {
        if let Some(bound) = self.bound_addr()? {
            return Ok(bound);
        }
        let acceptor = TcpAcceptor::bind(&self.shared.config).map_err(ListenerError::Bind)?;
        self.bind_with(Arc::new(acceptor))
    }

    /// Use an already bound acceptor.
    ///
    /// Once bound, later calls drop `acceptor` and return the address of
    /// the first one.
    pub fn bind_with(&self, acceptor: Arc<dyn Acceptor>) -> Result<SocketAddr, ListenerError> {
        if self.shared.lifecycle.is_destroying() {
            return Err(ListenerError::Closed);
        }
        let mut slot = lock(&self.shared.acceptor);
        if let Some(bound) = slot.as_ref() {
            return bound.local_addr().map_err(ListenerError::Bind);
        }
        let local_addr = acceptor.local_addr().map_err(ListenerError::Bind)?;
        *slot = Some(acceptor);
        drop(slot);
        info!(listener = %self.shared.url, %local_addr, "bound");
        Ok(local_addr)
    }

    fn bound_addr(&self) -> Result<Option<SocketAddr>, ListenerError> {
        if self.shared.lifecycle.is_destroying() {
            return Err(ListenerError::Closed);
        }
        self.shared
            .current_acceptor()
            .map(|acceptor| acceptor.local_addr().map_err(ListenerError::Bind))
            .transpose()
    }

    /// Address the acceptor is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.current_acceptor().and_then(|acceptor| acceptor.local_addr().ok())
    }

    /// Start or resume accepting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), ListenerError> {
        let shared = &self.shared;
        if shared.lifecycle.is_destroying() {
            return Err(ListenerError::Closed);
        }
        if shared.current_acceptor().is_none() {
            return Err(ListenerError::NotBound);
        }
        if !shared.lifecycle.to_active() {
            return Ok(());
        }

        {
            let mut tasks = lock(&self.tasks);
            if tasks.is_empty() {
                tasks.push(tokio::spawn(manage(Arc::clone(shared))));
                tasks.push(tokio::spawn(reaper::run(Arc::clone(shared))));
            }
        }

        if shared.config.keepalive_select_enable
            && let Some(select) = &shared.select
        {
            let started = select.start();
            if !started {
                warn!(listener = %shared.url, "select manager failed to start");
            }
            shared.select_enabled.store(started, Ordering::Release);
        }

        info!(listener = %shared.url, "started");
        shared.wake_manager();
        Ok(())
    }

    /// Stop accepting. Established connections continue.
    pub fn stop(&self) {
        if self.shared.lifecycle.to_stopped() {
            self.shared.accept_gate.notify_waiters();
            info!(listener = %self.shared.url, "stopped");
        }
    }

    /// Close the listener and every connection.
    pub async fn close(&self) {
        let shared = &self.shared;
        if !shared.lifecycle.to_destroying() {
            return;
        }
        info!(listener = %shared.url, "closing");

        shared.select_enabled.store(false, Ordering::Release);
        if let Some(select) = &shared.select {
            select.close();
        }
        shared.throttle.close();
        shared.connections.close();
        shared.accept_gate.notify_waiters();
        shared.wake_manager();

        for link in shared.active_snapshot() {
            link.destroy();
        }
        let free: Vec<Arc<Link>> = lock(&shared.free_list).drain(..).collect();
        for link in free {
            link.destroy();
        }

        let acceptor = shared.current_acceptor();
        if let Some(acceptor) = &acceptor {
            let waiting = shared.idle_threads.load(Ordering::Acquire)
                + shared.start_threads.load(Ordering::Acquire);
            acceptor.wake_acceptors(waiting + WAKE_ACCEPTOR_SLACK).await;
        }

        let drained = async {
            loop {
                let notified = shared.drained.notified();
                if lock(&shared.active).is_empty() {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drained).await.is_err() {
            warn!(
                listener = %shared.url,
                remaining = lock(&shared.active).len(),
                "links still active after close timeout"
            );
        }

        shared.pool.close();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&shared.suspended).clear();
        lock(&shared.active).clear();
        *lock(&shared.acceptor) = None;
        shared.lifecycle.to_destroyed();
        info!(listener = %shared.url, "closed");
    }

    /// Listener lifecycle state.
    pub fn lifecycle(&self) -> LifecycleState {
        self.shared.lifecycle.state()
    }

    /// Whether a connection started at `connection_start` would be kept
    /// alive now.
    pub fn keepalive_allowed(&self, connection_start: Instant) -> bool {
        self.shared.keepalive_allowed_for(connection_start, Instant::now())
    }

    /// Subscribe to fatal link errors.
    pub fn fatal_events(&self) -> watch::Receiver<Option<FatalEvent>> {
        self.shared.fatal.subscribe()
    }

    /// Management snapshot.
    pub fn stats(&self) -> ListenerStats {
        let shared = &self.shared;
        let active = shared.active_snapshot();
        ListenerStats {
            url: shared.url.clone(),
            thread_count: shared.thread_count.load(Ordering::Acquire),
            idle_thread_count: shared.idle_threads.load(Ordering::Acquire),
            start_thread_count: shared.start_threads.load(Ordering::Acquire),
            keepalive_thread_count: shared.keepalive_threads.load(Ordering::Acquire),
            keepalive_count: shared.slots.allocated(),
            keepalive_select_count: shared.keepalive_select_count.load(Ordering::Acquire),
            active_connection_count: active.iter().filter(|link| link.state().is_active()).count(),
            comet_idle_count: lock(&shared.suspended).len(),
            free_list_count: lock(&shared.free_list).len(),
            lifetime: shared.lifetime.snapshot(),
        }
    }

    /// Diagnostic snapshot of every active link, by id.
    pub fn connection_info(&self) -> Vec<LinkInfo> {
        let mut info: Vec<LinkInfo> =
            self.shared.active_snapshot().iter().map(|link| link.info()).collect();
        info.sort_by_key(|info| info.id);
        info
    }

    /// The link a worker is currently driving.
    pub fn find_link_by_worker(&self, worker_id: u64) -> Option<Arc<Link>> {
        self.shared
            .active_snapshot()
            .into_iter()
            .find(|link| link.worker_id() == Some(worker_id))
    }

    /// Active link by id.
    pub fn link(&self, id: u64) -> Option<Arc<Link>> {
        lock(&self.shared.active).get(&id).cloned()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("url", &self.shared.url)
            .field("lifecycle", &self.shared.lifecycle.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient_accept_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient_accept_error(&io::Error::other("throttle closed")));
    }

    fn echo_listener(config: ListenerConfig) -> Listener {
        Listener::builder(config, Arc::new(crate::echo::LineEchoProtocol)).build().unwrap()
    }

    fn loopback() -> ListenerConfig {
        ListenerConfig { address: Some([127, 0, 0, 1].into()), port: 0, ..ListenerConfig::default() }
    }

    #[test]
    fn idle_places_are_bounded() {
        let listener =
            echo_listener(ListenerConfig { accept_thread_max: 2, ..ListenerConfig::default() });
        let shared = &listener.shared;

        let first = shared.enter_idle().unwrap();
        let _second = shared.enter_idle().unwrap();
        assert!(shared.enter_idle().is_none());
        assert_eq!(shared.idle_threads.load(Ordering::Acquire), 2);

        drop(first);
        assert_eq!(shared.idle_threads.load(Ordering::Acquire), 1);
        assert!(shared.enter_idle().is_some());
    }

    #[tokio::test]
    async fn second_bind_keeps_the_first_socket() {
        let listener = echo_listener(loopback());

        let first = listener.bind().unwrap();
        assert_ne!(first.port(), 0);
        assert_eq!(listener.bind().unwrap(), first);
        assert_eq!(listener.local_addr(), Some(first));
    }

    #[tokio::test]
    async fn bind_with_after_bind_returns_the_bound_address() {
        let listener = echo_listener(loopback());
        let first = listener.bind().unwrap();

        let other = TcpAcceptor::bind(&loopback()).unwrap();
        let other_addr = other.local_addr().unwrap();
        assert_ne!(other_addr, first);

        assert_eq!(listener.bind_with(Arc::new(other)).unwrap(), first);
        assert_eq!(listener.local_addr(), Some(first));
    }

    #[tokio::test]
    async fn closed_listener_refuses_bind() {
        let listener = echo_listener(loopback());
        listener.close().await;
        assert!(matches!(listener.bind(), Err(ListenerError::Closed)));
    }
}
