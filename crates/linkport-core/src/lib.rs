//! Linkport core lifecycle logic
//!
//! Pure, I/O-free pieces of the connection-lifecycle engine. Nothing in this
//! crate touches a socket or spawns a task; the server crate drives these
//! types and executes what they decide.
//!
//! # Architecture
//!
//! The connection lifecycle is an explicit state machine. A transition takes
//! the current [`ConnectionState`] and a [`LinkEvent`] and returns a
//! [`Transition`] naming the next state and the keepalive-slot action the
//! driver must apply. Admission decisions take the time as a parameter, so
//! the same rules are exercised by unit tests, property tests, and the
//! runtime.
//!
//! # Components
//!
//! - [`state`]: Connection states, events, and the transition table
//! - [`admission`]: Keepalive slots, keepalive admission, connection throttle
//! - [`lifecycle`]: Listener lifecycle (new, active, stopped, destroyed)
//! - [`config`]: Listener configuration and period parsing
//! - [`stats`]: Read-only management snapshots
//! - [`transport`]: Socket, acceptor, and TLS contracts
//! - [`error`]: State and configuration errors

pub mod admission;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod state;
pub mod stats;
pub mod transport;

pub use admission::{KeepalivePolicy, KeepaliveSlots, Throttle, ThrottlePermit};
pub use config::{ListenerConfig, parse_period};
pub use error::{ConfigError, StateError};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use state::{ConnectionState, LinkEvent, SlotAction, Transition};
pub use stats::{LifetimeCounters, LifetimeSnapshot, LinkInfo, ListenerStats};
pub use transport::{Acceptor, BoxedSocket, Socket, TlsFactory};
