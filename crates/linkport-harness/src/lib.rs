//! Test harness for the linkport listener.
//!
//! Transports and fixtures that drive a real [`linkport_server::Listener`]
//! without touching the host network:
//!
//! - [`memory`]: in-process connections over `tokio::io::duplex`, with a
//!   channel standing in for the listen backlog
//! - [`sim`]: an acceptor over turmoil's simulated TCP, for deterministic
//!   end-to-end runs
//! - [`recording`]: a line protocol whose commands exercise keepalive,
//!   comet and duplex paths and which records every callback
//! - [`fixture`]: a started listener plus line client helpers

pub mod fixture;
pub mod memory;
pub mod recording;
pub mod sim;

pub use fixture::{LineClient, TestServer, eventually, test_config};
pub use memory::{MemoryAcceptor, MemoryConnector, memory_transport};
pub use recording::{Event, RecordingProtocol};
pub use sim::SimAcceptor;
