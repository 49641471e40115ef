//! Runtime error types.

use std::io;

use linkport_core::{ConfigError, StateError};
use thiserror::Error;

/// Errors raised while driving a single link.
///
/// Only [`LinkError::Fatal`] escapes the link; everything else is resolved
/// by closing or destroying it.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Transport failure on the connection.
    #[error("i/o error: {0}")]
    Io(io::Error),

    /// Illegal state transition. A defect in the caller.
    #[error(transparent)]
    State(#[from] StateError),

    /// Condition the process cannot recover from, such as memory exhaustion.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The link was closed or destroyed by another task.
    #[error("link aborted")]
    Aborted,

    /// The connection session is owned by another task.
    #[error("link {0} is busy in another task")]
    Busy(u64),
}

impl LinkError {
    /// True for I/O errors that mean the peer went away.
    pub fn is_client_disconnect(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// True if the process should shut down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<io::Error> for LinkError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::OutOfMemory { Self::Fatal(e.to_string()) } else { Self::Io(e) }
    }
}

/// Listener errors.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listening socket could not be opened.
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The listener was closed.
    #[error("listener is closed")]
    Closed,

    /// `start` was called before `bind`.
    #[error("listener is not bound")]
    NotBound,
}

/// A fatal condition reported by a link.
///
/// Published on [`crate::Listener::fatal_events`]; the process is expected
/// to close the listener and exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalEvent {
    /// Link that hit the condition.
    pub link_id: u64,
    /// Description.
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_client_disconnects() {
        let reset = LinkError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.is_client_disconnect());

        let eof = LinkError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(eof.is_client_disconnect());

        let other = LinkError::from(io::Error::from(io::ErrorKind::InvalidData));
        assert!(!other.is_client_disconnect());
        assert!(!LinkError::Aborted.is_client_disconnect());
    }

    #[test]
    fn out_of_memory_is_fatal() {
        let err = LinkError::from(io::Error::from(io::ErrorKind::OutOfMemory));
        assert!(err.is_fatal());
    }
}
