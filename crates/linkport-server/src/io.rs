//! Connection streams.
//!
//! An accepted socket is wrapped in a [`CountingSocket`] so the listener can
//! report lifetime byte counts, then split into a buffered read half owned
//! by whichever task drives the link and a buffered write half behind an
//! async mutex. The write half is shared so a duplex upgrade can hand it to
//! application code while the runtime keeps reading.

use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::FutureExt;
use linkport_core::BoxedSocket;
use tokio::{
    io::{
        AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadBuf,
        ReadHalf, WriteHalf,
    },
    sync::Mutex as AsyncMutex,
};

/// Buffered read side of a connection.
pub type ReadStream = BufReader<ReadHalf<CountingSocket>>;

/// Buffered write side of a connection.
pub type WriteStream = BufWriter<WriteHalf<CountingSocket>>;

/// Write side shared between the runtime and a duplex handler.
pub type SharedWriteStream = Arc<AsyncMutex<WriteStream>>;

/// Socket wrapper counting bytes in both directions.
pub struct CountingSocket {
    inner: BoxedSocket,
    read: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
}

impl AsyncRead for CountingSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = buf.filled().len() - before;
            this.read.fetch_add(n as u64, Ordering::Relaxed);
        }
        poll
    }
}

impl AsyncWrite for CountingSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.written.fetch_add(*n as u64, Ordering::Relaxed);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Outcome of waiting for the next request on an idle connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadReady {
    /// Bytes are buffered.
    Data,
    /// The peer closed its side.
    Eof,
    /// Nothing arrived in time.
    Timeout,
}

/// Streams of one physical connection.
pub struct LinkIo {
    read: ReadStream,
    write: SharedWriteStream,
    read_bytes: Arc<AtomicU64>,
    write_bytes: Arc<AtomicU64>,
}

impl LinkIo {
    /// Wrap an accepted socket.
    pub fn new(socket: BoxedSocket) -> Self {
        let read_bytes = Arc::new(AtomicU64::new(0));
        let write_bytes = Arc::new(AtomicU64::new(0));
        let counting = CountingSocket {
            inner: socket,
            read: Arc::clone(&read_bytes),
            written: Arc::clone(&write_bytes),
        };
        let (read, write) = tokio::io::split(counting);

        Self {
            read: BufReader::new(read),
            write: Arc::new(AsyncMutex::new(BufWriter::new(write))),
            read_bytes,
            write_bytes,
        }
    }

    /// Read side.
    pub fn read_stream(&mut self) -> &mut ReadStream {
        &mut self.read
    }

    /// Write side.
    pub fn write_stream(&self) -> &SharedWriteStream {
        &self.write
    }

    /// Bytes read from the socket so far.
    pub fn read_count(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    /// Bytes written to the socket so far.
    pub fn write_count(&self) -> u64 {
        self.write_bytes.load(Ordering::Relaxed)
    }

    /// Bytes handed to the reader: socket reads minus what is still buffered.
    pub fn consumed_count(&self) -> u64 {
        self.read_count().saturating_sub(self.read.buffer().len() as u64)
    }

    /// Flush buffered output.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.write.lock().await.flush().await
    }

    /// Wait up to `timeout` for the next byte.
    ///
    /// Data already buffered counts as ready. The wait is cancel-safe: any
    /// bytes read stay in the buffer.
    pub async fn wait_readable(&mut self, timeout: Duration) -> io::Result<ReadReady> {
        if !self.read.buffer().is_empty() {
            return Ok(ReadReady::Data);
        }
        match tokio::time::timeout(timeout, self.read.fill_buf()).await {
            Err(_) => Ok(ReadReady::Timeout),
            Ok(Ok(buf)) if buf.is_empty() => Ok(ReadReady::Eof),
            Ok(Ok(_)) => Ok(ReadReady::Data),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Non-blocking check whether the peer has closed the connection.
    ///
    /// A read error counts as closed. Any data found stays buffered.
    pub fn is_read_eof(&mut self) -> bool {
        if !self.read.buffer().is_empty() {
            return false;
        }
        match self.read.fill_buf().now_or_never() {
            None => false,
            Some(Ok(buf)) => buf.is_empty(),
            Some(Err(_)) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn counts_bytes_both_ways() {
        let (client, server) = tokio::io::duplex(1024);
        let mut io = LinkIo::new(Box::new(server));
        let (mut client_read, mut client_write) = tokio::io::split(client);

        client_write.write_all(b"hello").await.unwrap();
        assert_eq!(io.wait_readable(Duration::from_secs(1)).await.unwrap(), ReadReady::Data);

        let mut buf = [0u8; 5];
        io.read_stream().read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(io.consumed_count(), 5);

        io.write_stream().lock().await.write_all(b"bye").await.unwrap();
        io.flush().await.unwrap();
        let mut out = [0u8; 3];
        client_read.read_exact(&mut out).await.unwrap();
        assert_eq!(io.write_count(), 3);
    }

    fn require_send<F: Send>(_: &F) {}

    #[tokio::test]
    async fn flush_can_run_on_a_spawned_task() {
        let (_client, server) = tokio::io::duplex(64);
        let mut io = LinkIo::new(Box::new(server));
        let flush = io.flush();
        require_send(&flush);
        flush.await.unwrap();
    }

    #[tokio::test]
    async fn idle_wait_times_out_then_sees_eof() {
        let (client, server) = tokio::io::duplex(64);
        let mut io = LinkIo::new(Box::new(server));

        let ready = io.wait_readable(Duration::from_millis(20)).await.unwrap();
        assert_eq!(ready, ReadReady::Timeout);
        assert!(!io.is_read_eof());

        drop(client);
        let ready = io.wait_readable(Duration::from_secs(1)).await.unwrap();
        assert_eq!(ready, ReadReady::Eof);
        assert!(io.is_read_eof());
    }
}
