//! Listener fixtures.

use std::{io, sync::Arc, time::Duration};

use linkport_core::ListenerConfig;
use linkport_server::{Listener, ListenerError, Protocol, SelectManager};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream},
    time::Instant,
};

use crate::{
    memory::{MemoryConnector, memory_transport},
    recording::RecordingProtocol,
};

/// How long helpers wait before giving up.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Configuration sized for tests: few acceptors, a small pool, no select
/// hand-off, and short reaper ticks.
pub fn test_config() -> ListenerConfig {
    ListenerConfig {
        accept_thread_min: 1,
        accept_thread_max: 2,
        keepalive_max: 16,
        keepalive_select_enable: false,
        keepalive_select_thread_timeout: Duration::from_millis(20),
        suspend_reaper_interval: Duration::from_millis(20),
        worker_max: 64,
        free_list_capacity: 8,
        ..ListenerConfig::default()
    }
}

/// A started listener serving [`RecordingProtocol`] over the in-memory
/// transport.
pub struct TestServer {
    /// The listener under test.
    pub listener: Listener,
    /// Protocol log and comet controllers.
    pub protocol: Arc<RecordingProtocol>,
    connector: MemoryConnector,
}

impl TestServer {
    /// Start a listener with `config`.
    pub fn start(config: ListenerConfig) -> Result<Self, ListenerError> {
        Self::start_with(config, None)
    }

    /// Start a listener with `config`, handing keepalives to `select`.
    pub fn start_with(
        config: ListenerConfig,
        select: Option<Arc<dyn SelectManager>>,
    ) -> Result<Self, ListenerError> {
        let protocol = RecordingProtocol::new();
        let shared: Arc<dyn Protocol> = Arc::clone(&protocol) as Arc<dyn Protocol>;
        let mut builder = Listener::builder(config, shared);
        if let Some(select) = select {
            builder = builder.select_manager(select);
        }
        let listener = builder.build()?;

        let (acceptor, connector) = memory_transport(64 * 1024);
        listener.bind_with(Arc::new(acceptor))?;
        listener.start()?;
        Ok(Self { listener, protocol, connector })
    }

    /// Open a client connection.
    pub fn connect(&self) -> io::Result<LineClient<DuplexStream>> {
        Ok(LineClient::new(self.connector.connect()?))
    }
}

/// Line-oriented test client.
pub struct LineClient<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> LineClient<S> {
    /// Wrap a connected stream.
    pub fn new(stream: S) -> Self {
        Self { stream: BufReader::new(stream) }
    }

    /// Send one line.
    pub async fn send(&mut self, line: &str) -> io::Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await
    }

    /// Next line, `None` at end of stream.
    ///
    /// # Errors
    ///
    /// `TimedOut` if nothing arrives within `within`.
    pub async fn read_line_within(&mut self, within: Duration) -> io::Result<Option<String>> {
        let mut line = String::new();
        let read = tokio::time::timeout(within, self.stream.read_line(&mut line))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Next line, waiting up to [`PATIENCE`].
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        self.read_line_within(PATIENCE).await
    }

    /// Send `line` and read the reply.
    pub async fn request(&mut self, line: &str) -> io::Result<Option<String>> {
        self.send(line).await?;
        self.read_line().await
    }

    /// Whether the server closed the connection within [`PATIENCE`].
    pub async fn is_closed(&mut self) -> bool {
        match self.read_line().await {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(e) => e.kind() != io::ErrorKind::TimedOut,
        }
    }
}

/// Poll `check` until it holds or [`PATIENCE`] runs out.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
