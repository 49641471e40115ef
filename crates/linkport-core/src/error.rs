//! Error types for the pure lifecycle pieces.

use thiserror::Error;

use crate::state::{ConnectionState, LinkEvent};

/// State machine errors.
///
/// An illegal transition is a defect in the code driving the link. It is
/// reported as-is and never mapped onto a nearby legal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    /// The event is not legal in the current state.
    #[error("illegal transition: {event} in state {state}")]
    IllegalTransition {
        /// State the link was in.
        state: ConnectionState,
        /// Event that was rejected.
        event: LinkEvent,
    },
}

/// Invalid listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A numeric option is below its minimum.
    #[error("{option} must be at least {min}, got {value}")]
    TooSmall {
        /// Option name, kebab-case.
        option: &'static str,
        /// Smallest accepted value.
        min: u64,
        /// Configured value.
        value: u64,
    },

    /// `accept-thread-max` is below `accept-thread-min`.
    #[error("accept-thread-max ({max}) must not be less than accept-thread-min ({min})")]
    AcceptThreadRange {
        /// Configured minimum.
        min: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The worker pool cannot host the acceptors plus at least one request.
    #[error("worker-max ({worker_max}) must exceed accept-thread-max ({accept_thread_max})")]
    WorkerPoolTooSmall {
        /// Configured worker ceiling.
        worker_max: usize,
        /// Configured acceptor ceiling.
        accept_thread_max: usize,
    },

    /// A period string could not be parsed.
    #[error("invalid period '{0}'")]
    InvalidPeriod(String),
}
