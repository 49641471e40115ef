//! Listener lifecycle.
//!
//! ```text
//! ┌─────┐ start ┌────────┐ stop  ┌─────────┐
//! │ New │──────>│ Active │<─────>│ Stopped │
//! └─────┘       └────────┘ start └─────────┘
//!    │              │ close          │ close
//!    v              v                v
//!          ┌────────────┐     ┌───────────┐
//!          │ Destroying │────>│ Destroyed │
//!          └────────────┘     └───────────┘
//! ```
//!
//! Stop is reversible, close is not. The state is a single atomic so any
//! task may read it without locking.

use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

/// Listener lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Created, not yet started.
    New = 0,
    /// Accepting connections.
    Active = 1,
    /// Not accepting; existing connections continue.
    Stopped = 2,
    /// Close in progress.
    Destroying = 3,
    /// Closed.
    Destroyed = 4,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Active,
            2 => Self::Stopped,
            3 => Self::Destroying,
            _ => Self::Destroyed,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Atomic lifecycle cell.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// A new lifecycle.
    pub const fn new() -> Self {
        Self { state: AtomicU8::new(LifecycleState::New as u8) }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Accepting connections.
    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    /// Close started or finished.
    pub fn is_destroying(&self) -> bool {
        matches!(self.state(), LifecycleState::Destroying | LifecycleState::Destroyed)
    }

    /// Close finished.
    pub fn is_destroyed(&self) -> bool {
        self.state() == LifecycleState::Destroyed
    }

    /// Move to `Active` from `New` or `Stopped`.
    pub fn to_active(&self) -> bool {
        self.swap_from(&[LifecycleState::New, LifecycleState::Stopped], LifecycleState::Active)
    }

    /// Move to `Stopped` from `Active`.
    pub fn to_stopped(&self) -> bool {
        self.swap_from(&[LifecycleState::Active], LifecycleState::Stopped)
    }

    /// Begin close. Only the first caller gets `true`.
    pub fn to_destroying(&self) -> bool {
        self.swap_from(
            &[LifecycleState::New, LifecycleState::Active, LifecycleState::Stopped],
            LifecycleState::Destroying,
        )
    }

    /// Finish close.
    pub fn to_destroyed(&self) {
        self.state.store(LifecycleState::Destroyed as u8, Ordering::Release);
    }

    fn swap_from(&self, from: &[LifecycleState], to: LifecycleState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                from.contains(&LifecycleState::from_u8(current)).then_some(to as u8)
            })
            .is_ok()
    }
}
