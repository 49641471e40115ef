//! Connection lifecycle state machine.
//!
//! Every physical connection carried by a link moves through the states in
//! this module. The transition table is a single exhaustive match in
//! [`ConnectionState::transition`], so the legal moves can be audited in one
//! place.
//!
//! # Architecture: Action-Based State Machine
//!
//! Transitions are pure. A transition never touches a listener directly;
//! instead it returns a [`Transition`] carrying the next state and a
//! [`SlotAction`] describing what must happen to the listener's global
//! keepalive-slot counter. The driver (the link runtime) applies the slot
//! action. This keeps the accounting rules testable without sockets.
//!
//! # State Machine
//!
//! ```text
//!              ┌──────┐ init ┌──────┐ accept ┌────────┐ client_connected ┌──────────────┐
//!   free-list  │ Idle │─────>│ Init │───────>│ Accept │─────────────────>│ RequestRead  │
//!              └──────┘      └──────┘        └────────┘                  └──────────────┘
//!                 ^                                                         │ dispatch
//!                 │ idle                                                    v
//!              ┌────────┐  close   ┌──────────────────┐  keepalive  ┌──────────────────┐
//!              │ Closed │<─────────│ RequestActive_KA │────────────>│ RequestKeepalive │
//!              └────────┘          └──────────────────┘<────────────└──────────────────┘
//!                                     │ comet      │ duplex  dispatch        │ keepalive_select
//!                                     v            v                          v
//!                               ┌──────────┐  ┌────────┐         ┌────────────────────────┐
//!                               │ Comet_KA │  │ Duplex │         │ RequestKeepaliveSelect │
//!                               └──────────┘  └────────┘         └────────────────────────┘
//!                      suspend ↕ resume
//!                             ┌──────────────────┐
//!                             │ CometSuspend_KA  │  (close is illegal; resume first)
//!                             └──────────────────┘
//! ```
//!
//! # Keepalive slots
//!
//! A state either holds one keepalive slot or none
//! ([`ConnectionState::is_keepalive_allocated`]). Every transition's
//! [`SlotAction`] is exactly the difference between the two states, so a
//! link that starts with no slot and applies every returned action holds a
//! slot if and only if its current state says it does. Close and destroy
//! release whatever is held, whatever the originating state.

use std::fmt;

use serde::Serialize;

use crate::error::StateError;

/// Lifecycle state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Allocated and ready to accept.
    Init,
    /// Pooled in the listener's free-list, no socket.
    Idle,
    /// Connection closed, ready for the next accept or for pooling.
    Closed,
    /// Permanently destroyed. Terminal.
    Destroyed,
    /// Waiting in accept for a new socket.
    Accept,
    /// Socket accepted, no request data read yet.
    RequestRead,
    /// Processing a request with a keepalive slot held.
    RequestActiveKa,
    /// Processing a request with keepalive forbidden.
    RequestActiveNka,
    /// A worker is blocked waiting for the next keepalive request.
    RequestKeepalive,
    /// Handed to the select manager, no worker attached.
    RequestKeepaliveSelect,
    /// Long-poll handler active, slot held.
    CometKa,
    /// Long-poll handler active, no slot.
    CometNka,
    /// Suspended waiting for a wake or timeout, slot held.
    CometSuspendKa,
    /// Suspended waiting for a wake or timeout, no slot.
    CometSuspendNka,
    /// Long-poll completed, pending clean-up, slot held.
    CometCompleteKa,
    /// Long-poll completed, pending clean-up, no slot.
    CometCompleteNka,
    /// Upgraded to a full-duplex read loop.
    Duplex,
    /// Duplex connection idle, waiting for the next read.
    DuplexKeepalive,
}

/// Events that drive [`ConnectionState::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEvent {
    /// Reset a pooled link to its initial state.
    Init,
    /// Enter accept.
    Accept,
    /// A socket was accepted.
    ClientConnected,
    /// Start processing a request.
    Dispatch {
        /// Result of the keepalive admission decision for this request.
        keepalive: bool,
    },
    /// Forbid keepalive for the current request.
    KillKeepalive,
    /// Request finished, wait for the next one.
    Keepalive,
    /// Hand the idle keepalive socket to the select manager.
    KeepaliveSelect,
    /// Start a long-poll (comet) request.
    Comet,
    /// Detach the worker from a comet request.
    CometSuspend,
    /// Re-attach a worker to a suspended comet request.
    CometResume,
    /// Re-enter request processing from a resumed comet request.
    CometDispatch,
    /// Mark a comet request complete.
    CometComplete,
    /// Upgrade to duplex.
    Duplex,
    /// Duplex data available.
    DuplexActive,
    /// Return a closed link to the free-list.
    Idle,
    /// Close the physical connection.
    Close,
    /// Destroy the link permanently.
    Destroy,
}

/// Effect of a transition on the listener's keepalive-slot counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAction {
    /// Counter unchanged.
    None,
    /// Take one slot.
    Allocate,
    /// Give back one slot.
    Release,
}

/// Result of a legal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State after the transition.
    pub next: ConnectionState,
    /// What the driver must do to the keepalive-slot counter.
    pub slot: SlotAction,
}

impl Transition {
    const fn to(next: ConnectionState) -> Self {
        Self { next, slot: SlotAction::None }
    }

    const fn allocate(next: ConnectionState) -> Self {
        Self { next, slot: SlotAction::Allocate }
    }

    const fn release(next: ConnectionState) -> Self {
        Self { next, slot: SlotAction::Release }
    }

    /// Close or destroy: release whatever `from` holds.
    fn retire(from: ConnectionState, next: ConnectionState) -> Self {
        if from.is_keepalive_allocated() { Self::release(next) } else { Self::to(next) }
    }
}

impl ConnectionState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 18] = [
        Self::Init,
        Self::Idle,
        Self::Closed,
        Self::Destroyed,
        Self::Accept,
        Self::RequestRead,
        Self::RequestActiveKa,
        Self::RequestActiveNka,
        Self::RequestKeepalive,
        Self::RequestKeepaliveSelect,
        Self::CometKa,
        Self::CometNka,
        Self::CometSuspendKa,
        Self::CometSuspendNka,
        Self::CometCompleteKa,
        Self::CometCompleteNka,
        Self::Duplex,
        Self::DuplexKeepalive,
    ];

    /// Apply `event` to this state.
    ///
    /// The function is total: every pair either yields a [`Transition`] or
    /// an [`StateError::IllegalTransition`]. Illegal transitions are
    /// programming defects in the caller and must be surfaced, never mapped
    /// to a nearby legal state.
    ///
    /// # Errors
    ///
    /// Returns `IllegalTransition` when `event` is not legal in this state.
    pub fn transition(self, event: LinkEvent) -> Result<Transition, StateError> {
        use ConnectionState as S;
        use LinkEvent as E;

        let transition = match (self, event) {
            // idle pool
            (S::Init | S::Idle, E::Init) => Transition::to(S::Init),
            (S::Init | S::Closed, E::Accept) => Transition::to(S::Accept),
            (S::Closed, E::Idle) => Transition::to(S::Idle),
            (S::Destroyed, E::Idle) => Transition::to(S::Destroyed),

            // accept and first request
            (S::Accept, E::ClientConnected) => Transition::to(S::RequestRead),
            (S::Accept | S::RequestRead, E::Dispatch { keepalive: true }) => {
                Transition::allocate(S::RequestActiveKa)
            },
            (S::Accept | S::RequestRead, E::Dispatch { keepalive: false }) => {
                Transition::to(S::RequestActiveNka)
            },
            // a slow first read may park as a keepalive
            (S::RequestRead, E::Keepalive) => Transition::allocate(S::RequestKeepalive),

            // slot holders entering a new request
            (
                S::RequestActiveKa
                | S::RequestKeepalive
                | S::RequestKeepaliveSelect
                | S::CometCompleteKa,
                E::Dispatch { keepalive: true },
            ) => Transition::to(S::RequestActiveKa),
            (
                S::RequestActiveKa
                | S::RequestKeepalive
                | S::RequestKeepaliveSelect
                | S::CometCompleteKa,
                E::Dispatch { keepalive: false },
            ) => Transition::release(S::RequestActiveNka),

            // keepalive revocation; a no-op where no slot is held
            (S::RequestActiveKa, E::KillKeepalive) => Transition::release(S::RequestActiveNka),
            (S::CometKa, E::KillKeepalive) => Transition::release(S::CometNka),
            (S::CometSuspendKa, E::KillKeepalive) => Transition::release(S::CometSuspendNka),
            (S::CometCompleteKa, E::KillKeepalive) => Transition::release(S::CometCompleteNka),
            (state, E::KillKeepalive) => Transition::to(state),

            // keepalive wait
            (S::RequestActiveKa | S::CometCompleteKa, E::Keepalive) => {
                Transition::to(S::RequestKeepalive)
            },
            (S::Duplex, E::Keepalive) => Transition::to(S::DuplexKeepalive),
            (S::RequestKeepalive, E::KeepaliveSelect) => Transition::to(S::RequestKeepaliveSelect),

            // comet
            (S::RequestActiveKa, E::Comet) => Transition::to(S::CometKa),
            (S::RequestActiveNka, E::Comet) => Transition::to(S::CometNka),
            (S::CometKa, E::CometSuspend) => Transition::to(S::CometSuspendKa),
            (S::CometNka, E::CometSuspend) => Transition::to(S::CometSuspendNka),
            (S::CometSuspendKa, E::CometResume) => Transition::to(S::CometKa),
            (S::CometSuspendNka, E::CometResume) => Transition::to(S::CometNka),
            (S::CometKa, E::CometDispatch) => Transition::to(S::RequestActiveKa),
            (S::CometNka, E::CometDispatch) => Transition::to(S::RequestActiveNka),
            (S::CometKa, E::CometComplete) => Transition::to(S::CometCompleteKa),
            (S::CometNka, E::CometComplete) => Transition::to(S::CometCompleteNka),
            (S::CometCompleteKa | S::CometCompleteNka, E::CometComplete) => Transition::to(self),

            // duplex
            (S::RequestActiveKa, E::Duplex) => Transition::release(S::Duplex),
            (S::RequestActiveNka, E::Duplex) => Transition::to(S::Duplex),
            (S::Duplex | S::DuplexKeepalive, E::DuplexActive) => Transition::to(S::Duplex),

            // close: a suspended link must be resumed before it can close
            (S::CometSuspendKa | S::CometSuspendNka, E::Close) => {
                return Err(StateError::IllegalTransition { state: self, event });
            },
            (S::Destroyed, E::Close | E::Destroy) => Transition::to(S::Destroyed),
            (S::Idle, E::Close) => Transition::to(S::Idle),
            (state, E::Close) => Transition::retire(state, S::Closed),

            // destroy is legal from every other state, suspended included
            (state, E::Destroy) => Transition::retire(state, S::Destroyed),

            (state, event) => return Err(StateError::IllegalTransition { state, event }),
        };

        Ok(transition)
    }

    /// Pooled in the free-list.
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Any comet state.
    pub const fn is_comet(self) -> bool {
        matches!(
            self,
            Self::CometKa
                | Self::CometNka
                | Self::CometSuspendKa
                | Self::CometSuspendNka
                | Self::CometCompleteKa
                | Self::CometCompleteNka
        )
    }

    /// Comet handler running on a worker.
    pub const fn is_comet_active(self) -> bool {
        matches!(self, Self::CometKa | Self::CometNka)
    }

    /// Comet suspended, no worker attached.
    pub const fn is_comet_suspend(self) -> bool {
        matches!(self, Self::CometSuspendKa | Self::CometSuspendNka)
    }

    /// Comet completed, pending clean-up.
    pub const fn is_comet_complete(self) -> bool {
        matches!(self, Self::CometCompleteKa | Self::CometCompleteNka)
    }

    /// Upgraded to duplex.
    pub const fn is_duplex(self) -> bool {
        matches!(self, Self::Duplex | Self::DuplexKeepalive)
    }

    /// True if the state holds one of the listener's keepalive slots.
    pub const fn is_keepalive_allocated(self) -> bool {
        matches!(
            self,
            Self::RequestActiveKa
                | Self::RequestKeepalive
                | Self::RequestKeepaliveSelect
                | Self::CometKa
                | Self::CometSuspendKa
                | Self::CometCompleteKa
        )
    }

    /// Waiting for data on an idle connection, request or duplex.
    pub const fn is_keepalive(self) -> bool {
        matches!(self, Self::RequestKeepalive | Self::RequestKeepaliveSelect | Self::DuplexKeepalive)
    }

    /// Accepting or processing.
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Accept | Self::RequestRead | Self::RequestActiveKa | Self::RequestActiveNka
        )
    }

    /// A request is being read or processed.
    pub const fn is_request_active(self) -> bool {
        matches!(self, Self::RequestRead | Self::RequestActiveKa | Self::RequestActiveNka)
    }

    /// Closed or destroyed.
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed | Self::Destroyed)
    }

    /// Terminal.
    pub const fn is_destroyed(self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// May be returned to the free-list.
    pub const fn is_allow_idle(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Upper-case name used in logs and management readouts.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Idle => "IDLE",
            Self::Closed => "CLOSED",
            Self::Destroyed => "DESTROYED",
            Self::Accept => "ACCEPT",
            Self::RequestRead => "REQUEST_READ",
            Self::RequestActiveKa => "REQUEST_ACTIVE_KA",
            Self::RequestActiveNka => "REQUEST_ACTIVE_NKA",
            Self::RequestKeepalive => "REQUEST_KEEPALIVE",
            Self::RequestKeepaliveSelect => "REQUEST_KEEPALIVE_SELECT",
            Self::CometKa => "COMET_KA",
            Self::CometNka => "COMET_NKA",
            Self::CometSuspendKa => "COMET_SUSPEND_KA",
            Self::CometSuspendNka => "COMET_SUSPEND_NKA",
            Self::CometCompleteKa => "COMET_COMPLETE_KA",
            Self::CometCompleteNka => "COMET_COMPLETE_NKA",
            Self::Duplex => "DUPLEX",
            Self::DuplexKeepalive => "DUPLEX_KEEPALIVE",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl LinkEvent {
    /// Every event, with both dispatch variants.
    pub const ALL: [Self; 18] = [
        Self::Init,
        Self::Accept,
        Self::ClientConnected,
        Self::Dispatch { keepalive: true },
        Self::Dispatch { keepalive: false },
        Self::KillKeepalive,
        Self::Keepalive,
        Self::KeepaliveSelect,
        Self::Comet,
        Self::CometSuspend,
        Self::CometResume,
        Self::CometDispatch,
        Self::CometComplete,
        Self::Duplex,
        Self::DuplexActive,
        Self::Idle,
        Self::Close,
        Self::Destroy,
    ];
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Accept => "accept",
            Self::ClientConnected => "client_connected",
            Self::Dispatch { keepalive: true } => "dispatch(keepalive)",
            Self::Dispatch { keepalive: false } => "dispatch(no-keepalive)",
            Self::KillKeepalive => "kill_keepalive",
            Self::Keepalive => "keepalive",
            Self::KeepaliveSelect => "keepalive_select",
            Self::Comet => "comet",
            Self::CometSuspend => "comet_suspend",
            Self::CometResume => "comet_resume",
            Self::CometDispatch => "comet_dispatch",
            Self::CometComplete => "comet_complete",
            Self::Duplex => "duplex",
            Self::DuplexActive => "duplex_active",
            Self::Idle => "idle",
            Self::Close => "close",
            Self::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

impl fmt::Display for SlotAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Allocate => f.write_str("+slot"),
            Self::Release => f.write_str("-slot"),
        }
    }
}
