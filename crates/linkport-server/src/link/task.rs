//! Worker tasks driving a link.
//!
//! Three entry points run on the worker pool:
//!
//! - [`accept_task`]: accept a socket, serve it, and loop back to accept
//!   while the listener needs acceptors.
//! - [`resume_task`]: continue a suspended comet request.
//! - [`keepalive_task`]: continue a keepalive connection the select
//!   manager found readable.
//!
//! All three share the request loop in `drive`. Each run owns the session
//! in a local slot; a hand-off empties the slot, anything else leaves the
//! session there for `Link::settle` to close.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use futures::FutureExt;
use linkport_core::LinkEvent;
use tracing::{debug, trace, warn};

use super::{Link, Next, ResumeKind, Session, Suspend};
use crate::{
    error::LinkError,
    io::{LinkIo, ReadReady},
    listener::Accepted,
    select::KeepaliveHandoff,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Request,
    Resume(ResumeKind),
}

enum KeepaliveFlow {
    Next,
    Close,
    Detached,
}

struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) async fn accept_task(link: Arc<Link>, worker_id: u64) {
    let _worker = link.enter_worker(worker_id);
    let shared = Arc::clone(&link.shared);
    shared.start_threads.fetch_sub(1, Ordering::AcqRel);

    while let Some(accepted) = shared.accept(&link).await {
        let mut slot = None;
        let result = AssertUnwindSafe(connect(&link, &mut slot, accepted)).catch_unwind().await;
        if link.settle(&mut slot, result) {
            // the session lives on in the suspend set or the select manager
            shared.wake_manager();
            return;
        }
        if !shared.lifecycle.is_active() || link.is_abort_requested() {
            break;
        }
    }
    link.release();
}

pub(crate) async fn resume_task(link: Arc<Link>, worker_id: u64) {
    let Some((session, kind)) = link.take_resume() else {
        trace!(link_id = link.id, "resume found no suspended session");
        return;
    };
    run_detached(link, worker_id, session, Step::Resume(kind)).await;
}

pub(crate) async fn keepalive_task(link: Arc<Link>, worker_id: u64, session: Session) {
    run_detached(link, worker_id, session, Step::Request).await;
}

async fn run_detached(link: Arc<Link>, worker_id: u64, session: Session, step: Step) {
    let _worker = link.enter_worker(worker_id);
    let mut slot = Some(session);
    let result = AssertUnwindSafe(drive(&link, &mut slot, step)).catch_unwind().await;
    if !link.settle(&mut slot, result) {
        link.release();
    }
}

async fn connect(
    link: &Arc<Link>,
    slot: &mut Option<Session>,
    accepted: Accepted,
) -> Result<(), LinkError> {
    let Accepted { socket, remote_addr, permit } = accepted;
    link.client_connected(remote_addr, permit)?;
    // this acceptor is busy now; let the manager top up
    link.shared.wake_manager();

    let socket = match &link.shared.tls {
        Some(tls) => link.abortable(tls.wrap(socket)).await??,
        None => socket,
    };

    let mut conn = link.take_protocol_connection();
    conn.init();
    conn.on_start_connection();
    *slot = Some(Session::new(conn, LinkIo::new(socket)));

    debug!(link_id = link.id, %remote_addr, "connection accepted");
    drive(link, slot, Step::Request).await
}

/// The request loop.
async fn drive(
    link: &Arc<Link>,
    slot: &mut Option<Session>,
    mut step: Step,
) -> Result<(), LinkError> {
    loop {
        let session = slot.as_mut().ok_or(LinkError::Busy(link.id))?;
        match step {
            Step::Request => link.dispatch()?,
            Step::Resume(_) => link.apply(LinkEvent::CometDispatch)?,
        };

        let keepalive = run_handler(link, session, step).await?;
        let next = link.after_request(keepalive, session.duplex.is_some())?;
        link.abortable(session.io.flush()).await??;

        match next {
            Next::Close => return Ok(()),
            Next::Duplex => return duplex_loop(link, session).await,
            Next::Suspend => {
                let session = slot.take().ok_or(LinkError::Busy(link.id))?;
                match link.suspend(session) {
                    Suspend::Parked => return Ok(()),
                    Suspend::Resume(session) => {
                        *slot = Some(session);
                        step = Step::Resume(ResumeKind::Wake);
                    },
                    Suspend::Abort(session) => {
                        *slot = Some(session);
                        return Ok(());
                    },
                }
            },
            Next::Keepalive => match keepalive_wait(link, slot).await? {
                KeepaliveFlow::Next => step = Step::Request,
                KeepaliveFlow::Close | KeepaliveFlow::Detached => return Ok(()),
            },
        }
    }
}

async fn run_handler(
    link: &Arc<Link>,
    session: &mut Session,
    step: Step,
) -> Result<bool, LinkError> {
    let (conn, mut ctx) = session.context(link);
    let result = match step {
        Step::Request => link.abortable(conn.handle_request(&mut ctx)).await?,
        Step::Resume(ResumeKind::Wake) => link.abortable(conn.handle_resume(&mut ctx)).await?,
        Step::Resume(ResumeKind::Timeout) => {
            link.abortable(conn.handle_timeout(&mut ctx)).await?
        },
    };
    drop(ctx);

    link.end_request(session.conn.protocol_request_url());
    Ok(result?)
}

/// Wait for the next request on a keepalive connection.
///
/// With a select manager the worker only does a quick read before handing
/// the connection off; without one, or when the manager declines, it reads
/// until the keepalive expiry, bounded by `socket-timeout`.
async fn keepalive_wait(
    link: &Arc<Link>,
    slot: &mut Option<Session>,
) -> Result<KeepaliveFlow, LinkError> {
    let expire = link.begin_keepalive()?;
    let config = &link.shared.config;
    let select = link.shared.select_for_keepalive();

    let first_wait = if select.is_some() {
        config.keepalive_select_thread_timeout
    } else {
        config.socket_timeout
    };
    let ready = wait_readable(link, slot, expire, first_wait).await?;
    if ready != ReadReady::Timeout || Instant::now() >= expire {
        return Ok(flow(ready));
    }

    let Some(select) = select else {
        return Ok(KeepaliveFlow::Close);
    };
    let session = slot.take().ok_or(LinkError::Busy(link.id))?;
    match select.keepalive(KeepaliveHandoff::new(Arc::clone(link), session)) {
        Ok(()) => {
            link.shared.lifetime.add_keepalive_select();
            return Ok(KeepaliveFlow::Detached);
        },
        Err(handoff) => {
            trace!(link_id = link.id, "select manager declined keepalive");
            *slot = Some(handoff.into_session());
        },
    }

    let ready = wait_readable(link, slot, expire, config.socket_timeout).await?;
    Ok(flow(ready))
}

async fn wait_readable(
    link: &Arc<Link>,
    slot: &mut Option<Session>,
    expire: Instant,
    cap: Duration,
) -> Result<ReadReady, LinkError> {
    let session = slot.as_mut().ok_or(LinkError::Busy(link.id))?;
    let wait = expire.saturating_duration_since(Instant::now()).min(cap);
    let _waiting = CountGuard::new(&link.shared.keepalive_threads);
    Ok(link.abortable(session.io.wait_readable(wait)).await??)
}

fn flow(ready: ReadReady) -> KeepaliveFlow {
    match ready {
        ReadReady::Data => KeepaliveFlow::Next,
        ReadReady::Eof | ReadReady::Timeout => KeepaliveFlow::Close,
    }
}

/// Drive an upgraded connection until it closes or goes idle too long.
async fn duplex_loop(link: &Arc<Link>, session: &mut Session) -> Result<(), LinkError> {
    loop {
        let Some(duplex) = session.duplex.as_mut() else {
            return Ok(());
        };
        if duplex.controller.is_closed() {
            return Ok(());
        }

        let idle = link.begin_duplex_wait()?;
        let ready = link.abortable(session.io.wait_readable(idle)).await??;
        if ready != ReadReady::Data {
            trace!(link_id = link.id, ?ready, "duplex connection ended");
            return Ok(());
        }
        link.apply(LinkEvent::DuplexActive)?;

        let before = session.io.consumed_count();
        link.abortable(duplex.handler.on_read(&duplex.controller, session.io.read_stream()))
            .await??;
        link.abortable(session.io.flush()).await??;

        if session.io.consumed_count() == before {
            warn!(link_id = link.id, "duplex read consumed no data, closing");
            return Ok(());
        }
    }
}
