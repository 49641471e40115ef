//! Recording line protocol.
//!
//! Each request is one line, `<command> [argument]`:
//!
//! | command | effect |
//! |---|---|
//! | `echo <text>` | replies `<text>`, keeps alive |
//! | `close` | replies `bye`, does not keep alive |
//! | `kill` | revokes keepalive, replies `killed` |
//! | `comet [ms]` | starts a comet request, optionally with an idle limit |
//! | `comet-wake` | starts comet and wakes it before returning |
//! | `comet-complete` | starts comet and completes it before returning |
//! | `complete` | completes without a comet request, replies `illegal` if refused |
//! | `upgrade` | switches to a duplex echo, replies `upgraded` |
//! | `fatal` | fails with an out-of-memory error |
//! | `panic` | panics inside the handler |
//!
//! A resumed comet request replies `resumed` and keeps alive; a timed out
//! one replies `timeout` and closes. Every callback is appended to an
//! [`Event`] log, and every comet controller is published for the test to
//! pick up.

use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use linkport_server::{
    AsyncController, DuplexController, DuplexListener, LinkError, Protocol, ProtocolConnection,
    ReadStream, RequestContext,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt},
    sync::{Mutex as AsyncMutex, mpsc},
};

/// A protocol callback, tagged with the link id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `create_connection`
    Created(u64),
    /// `on_start_connection`
    Started(u64),
    /// `handle_request` read a line
    Request(u64, String),
    /// `handle_resume`
    Resumed(u64),
    /// `handle_timeout`
    TimedOut(u64),
    /// `on_close_connection`
    Closed(u64),
    /// A duplex handler received a line
    DuplexRead(u64, String),
    /// A duplex handler completed
    DuplexCompleted(u64),
}

struct Recorder {
    events: Mutex<Vec<Event>>,
    controllers: mpsc::UnboundedSender<AsyncController>,
}

impl Recorder {
    fn record(&self, event: Event) {
        tracing::trace!(?event, "recorded");
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

/// Line protocol recording every callback.
pub struct RecordingProtocol {
    recorder: Arc<Recorder>,
    controllers: AsyncMutex<mpsc::UnboundedReceiver<AsyncController>>,
}

impl RecordingProtocol {
    /// New protocol with an empty log.
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            recorder: Arc::new(Recorder { events: Mutex::new(Vec::new()), controllers: tx }),
            controllers: AsyncMutex::new(rx),
        })
    }

    /// Snapshot of the log.
    pub fn events(&self) -> Vec<Event> {
        self.recorder.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of logged events matching `filter`.
    pub fn count(&self, filter: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|event| filter(event)).count()
    }

    /// Next comet controller started by a handler.
    pub async fn next_controller(&self, within: Duration) -> Option<AsyncController> {
        let mut controllers = self.controllers.lock().await;
        tokio::time::timeout(within, controllers.recv()).await.ok().flatten()
    }
}

impl Protocol for RecordingProtocol {
    fn create_connection(&self, link_id: u64) -> Box<dyn ProtocolConnection> {
        self.recorder.record(Event::Created(link_id));
        Box::new(RecordingConnection { link_id, recorder: Arc::clone(&self.recorder), last: None })
    }

    fn protocol_name(&self) -> &str {
        "test"
    }
}

struct RecordingConnection {
    link_id: u64,
    recorder: Arc<Recorder>,
    last: Option<String>,
}

fn to_io(e: LinkError) -> io::Error {
    io::Error::other(e)
}

async fn reply(ctx: &mut RequestContext<'_>, text: &str) -> io::Result<()> {
    let mut out = ctx.write_stream().await;
    out.write_all(text.as_bytes()).await?;
    out.write_all(b"\n").await
}

async fn read_line(read: &mut ReadStream) -> io::Result<Option<String>> {
    let mut line = String::new();
    if read.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

#[allow(clippy::panic)]
fn fail_in_handler() -> ! {
    panic!("handler failure requested")
}

#[async_trait]
impl ProtocolConnection for RecordingConnection {
    fn init(&mut self) {
        self.last = None;
    }

    fn on_start_connection(&mut self) {
        self.recorder.record(Event::Started(self.link_id));
    }

    async fn handle_request(&mut self, ctx: &mut RequestContext<'_>) -> io::Result<bool> {
        let Some(line) = read_line(ctx.read_stream()).await? else {
            return Ok(false);
        };
        self.recorder.record(Event::Request(self.link_id, line.clone()));
        self.last = Some(line.clone());

        let (command, argument) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        match command {
            "echo" => {
                reply(ctx, argument).await?;
                Ok(true)
            },
            "close" => {
                reply(ctx, "bye").await?;
                Ok(false)
            },
            "kill" => {
                ctx.kill_keepalive().map_err(to_io)?;
                reply(ctx, "killed").await?;
                Ok(true)
            },
            "comet" => {
                let controller = ctx.start_comet().map_err(to_io)?;
                if let Ok(ms) = argument.parse::<u64>() {
                    controller.set_max_idle_time(Duration::from_millis(ms));
                }
                let _ = self.recorder.controllers.send(controller);
                Ok(true)
            },
            "comet-wake" => {
                let controller = ctx.start_comet().map_err(to_io)?;
                controller.wake();
                Ok(true)
            },
            "comet-complete" => {
                let controller = ctx.start_comet().map_err(to_io)?;
                controller.complete().map_err(to_io)?;
                reply(ctx, "completed").await?;
                Ok(true)
            },
            "complete" => {
                let answer = match ctx.link().complete() {
                    Ok(()) => "completed",
                    Err(LinkError::State(_)) => "illegal",
                    Err(e) => return Err(to_io(e)),
                };
                reply(ctx, answer).await?;
                Ok(true)
            },
            "upgrade" => {
                let handler =
                    DuplexEcho { link_id: self.link_id, recorder: Arc::clone(&self.recorder) };
                ctx.start_duplex(Box::new(handler)).map_err(to_io)?;
                reply(ctx, "upgraded").await?;
                Ok(true)
            },
            "fatal" => Err(io::Error::from(io::ErrorKind::OutOfMemory)),
            "panic" => fail_in_handler(),
            _ => {
                reply(ctx, "unknown").await?;
                Ok(true)
            },
        }
    }

    async fn handle_resume(&mut self, ctx: &mut RequestContext<'_>) -> io::Result<bool> {
        self.recorder.record(Event::Resumed(self.link_id));
        reply(ctx, "resumed").await?;
        Ok(true)
    }

    async fn handle_timeout(&mut self, ctx: &mut RequestContext<'_>) -> io::Result<bool> {
        self.recorder.record(Event::TimedOut(self.link_id));
        reply(ctx, "timeout").await?;
        Ok(false)
    }

    fn on_close_connection(&mut self) {
        self.recorder.record(Event::Closed(self.link_id));
    }

    fn protocol_request_url(&self) -> Option<String> {
        self.last.as_ref().map(|line| format!("test:{line}"))
    }
}

/// Duplex handler echoing lines with a `duplex:` prefix; `quit` closes.
struct DuplexEcho {
    link_id: u64,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl DuplexListener for DuplexEcho {
    async fn on_read(
        &mut self,
        controller: &DuplexController,
        read: &mut ReadStream,
    ) -> io::Result<()> {
        let Some(line) = read_line(read).await? else {
            return Ok(());
        };
        self.recorder.record(Event::DuplexRead(self.link_id, line.clone()));
        if line == "quit" {
            controller.close();
            return Ok(());
        }

        let write = controller.write_stream();
        let mut out = write.lock().await;
        out.write_all(format!("duplex:{line}\n").as_bytes()).await?;
        Ok(())
    }

    fn on_complete(&mut self, _controller: &DuplexController) {
        self.recorder.record(Event::DuplexCompleted(self.link_id));
    }
}
