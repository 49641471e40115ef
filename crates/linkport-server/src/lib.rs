//! Linkport server runtime
//!
//! Drives the connection lifecycle defined in `linkport-core` over real
//! sockets. A [`Listener`] accepts connections through an
//! [`linkport_core::Acceptor`], binds each to a reusable [`Link`], and runs
//! the link's request loop on a bounded [`WorkerPool`]. Protocol code plugs
//! in through [`Protocol`] and never sees the state machine directly; it
//! steers the lifecycle with its return values and the entry points on
//! [`RequestContext`].
//!
//! # Architecture
//!
//! ```text
//! Acceptor ──► Listener ──► Link ──► ProtocolConnection
//!                 │           │
//!                 │           ├── keepalive ──► SelectManager
//!                 │           ├── comet ──────► AsyncController + reaper
//!                 │           └── duplex ─────► DuplexListener
//!                 └── free-list / active set / suspend set
//! ```
//!
//! Every transition goes through [`linkport_core::ConnectionState::transition`];
//! this crate executes what it decides (slot accounting, timers, hand-offs)
//! and never decides a state by itself.
//!
//! # Components
//!
//! - [`listener`]: Bind, start, stop, close, acceptor management, stats
//! - [`protocol`]: Protocol contracts and the request context
//! - [`controller`]: Comet and duplex handles for application code
//! - [`select`]: Keepalive select manager contract and a reactor-backed
//!   implementation
//! - [`pool`]: Bounded worker pool
//! - [`io`]: Counted, buffered connection streams
//! - [`tcp`]: TCP acceptor
//! - [`echo`]: Line-echo protocol served by the binary
//! - [`error`]: Link and listener errors

pub mod controller;
pub mod echo;
pub mod error;
pub mod io;
mod link;
pub mod listener;
pub mod pool;
pub mod protocol;
mod reaper;
pub mod select;
pub mod tcp;

pub use controller::{AsyncController, DuplexController};
pub use echo::LineEchoProtocol;
pub use error::{FatalEvent, LinkError, ListenerError};
pub use io::{LinkIo, ReadReady, ReadStream, SharedWriteStream, WriteStream};
pub use link::Link;
pub use listener::{Listener, ListenerBuilder};
pub use pool::WorkerPool;
pub use protocol::{DuplexListener, Protocol, ProtocolConnection, RequestContext};
pub use select::{KeepaliveHandoff, ReactorSelectManager, SelectManager, SelectedLink};
pub use tcp::TcpAcceptor;
