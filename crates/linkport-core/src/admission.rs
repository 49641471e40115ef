//! Admission control.
//!
//! Two independent gates decide how much work a listener takes on:
//!
//! - Keepalive slots bound how many connections may be kept open past the
//!   current request. [`KeepaliveSlots`] is the global counter and
//!   [`KeepalivePolicy`] the admission rule.
//! - [`Throttle`] bounds how many connections are accepted at once. The
//!   listener uses one throttle for `throttle-concurrent-max` and another
//!   for `connection-max`.
//!
//! Slots are only ever taken through a bounded compare-and-swap, so the
//! counter cannot exceed the ceiling even when many links dispatch at once.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::state::SlotAction;

/// Global keepalive-slot counter of a listener.
#[derive(Debug, Default)]
pub struct KeepaliveSlots {
    allocated: AtomicUsize,
}

impl KeepaliveSlots {
    /// Counter with no slot taken.
    pub const fn new() -> Self {
        Self { allocated: AtomicUsize::new(0) }
    }

    /// Slots currently held.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Take one slot if fewer than `max` are held.
    pub fn try_allocate(&self, max: usize) -> bool {
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    /// Give one slot back. Never goes below zero.
    ///
    /// Returns false if no slot was held, which means a caller released
    /// twice.
    pub fn release(&self) -> bool {
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Apply the slot action of a transition.
    ///
    /// Returns false if an allocation found the counter at `max` or a
    /// release found it at zero. Nothing changes in either case.
    pub fn apply(&self, action: SlotAction, max: usize) -> bool {
        match action {
            SlotAction::None => true,
            SlotAction::Allocate => self.try_allocate(max),
            SlotAction::Release => self.release(),
        }
    }
}

/// Keepalive admission rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepalivePolicy {
    /// Ceiling on slots held across the listener.
    pub max: usize,
    /// Connections older than this are not kept alive.
    pub connection_time_max: Duration,
}

impl KeepalivePolicy {
    /// Whether a connection may be kept alive past its current request.
    ///
    /// Holders and newcomers are judged alike: keepalive needs the counter
    /// below `max`. A holder denied at capacity gives its slot back when the
    /// request is dispatched without keepalive.
    pub fn allows(
        &self,
        slots: &KeepaliveSlots,
        connection_start: Instant,
        now: Instant,
    ) -> bool {
        let age = now.saturating_duration_since(connection_start);
        if age > self.connection_time_max {
            return false;
        }

        slots.allocated() < self.max
    }
}

/// Bound on concurrently admitted connections.
///
/// An unlimited throttle hands out permits that hold nothing.
#[derive(Debug, Clone)]
pub struct Throttle {
    max: Option<usize>,
    semaphore: Option<Arc<Semaphore>>,
}

/// Admission held by one connection. Dropping it frees the place.
#[derive(Debug)]
pub struct ThrottlePermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl Throttle {
    /// Throttle admitting at most `max` connections, or unlimited.
    pub fn new(max: Option<usize>) -> Self {
        let semaphore = max.map(|max| Arc::new(Semaphore::new(max)));
        Self { max, semaphore }
    }

    /// Configured ceiling.
    pub fn max(&self) -> Option<usize> {
        self.max
    }

    /// Places left, `None` when unlimited.
    pub fn available(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }

    /// Admit a connection without waiting.
    pub fn try_admit(&self) -> Option<ThrottlePermit> {
        match &self.semaphore {
            None => Some(ThrottlePermit { _permit: None }),
            Some(semaphore) => Arc::clone(semaphore)
                .try_acquire_owned()
                .ok()
                .map(|permit| ThrottlePermit { _permit: Some(permit) }),
        }
    }

    /// Wait for a place. Returns `None` once the throttle is closed.
    pub async fn admit(&self) -> Option<ThrottlePermit> {
        match &self.semaphore {
            None => Some(ThrottlePermit { _permit: None }),
            Some(semaphore) => Arc::clone(semaphore)
                .acquire_owned()
                .await
                .ok()
                .map(|permit| ThrottlePermit { _permit: Some(permit) }),
        }
    }

    /// Fail every pending and future [`Throttle::admit`].
    pub fn close(&self) {
        if let Some(semaphore) = &self.semaphore {
            semaphore.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max: usize) -> KeepalivePolicy {
        KeepalivePolicy { max, connection_time_max: Duration::from_secs(600) }
    }

    #[test]
    fn allocation_is_bounded() {
        let slots = KeepaliveSlots::new();
        assert!(slots.try_allocate(2));
        assert!(slots.try_allocate(2));
        assert!(!slots.try_allocate(2));
        assert_eq!(slots.allocated(), 2);
    }

    #[test]
    fn release_saturates_at_zero() {
        let slots = KeepaliveSlots::new();
        assert!(!slots.release());
        assert_eq!(slots.allocated(), 0);
    }

    #[test]
    fn keepalive_needs_a_free_slot() {
        let slots = KeepaliveSlots::new();
        for _ in 0..10 {
            assert!(slots.try_allocate(10));
        }
        let now = Instant::now();

        assert!(!policy(10).allows(&slots, now, now));

        assert!(slots.release());
        assert!(policy(10).allows(&slots, now, now));
    }

    #[test]
    fn old_connection_is_not_kept_alive() {
        let slots = KeepaliveSlots::new();
        let start = Instant::now();
        let later = start + Duration::from_secs(601);

        assert!(policy(10).allows(&slots, start, start));
        assert!(!policy(10).allows(&slots, start, later));
    }

    #[test]
    fn unlimited_throttle_always_admits() {
        let throttle = Throttle::new(None);
        let permits: Vec<_> = (0..100).filter_map(|_| throttle.try_admit()).collect();
        assert_eq!(permits.len(), 100);
        assert_eq!(throttle.available(), None);
    }

    #[test]
    fn bounded_throttle_frees_on_drop() {
        let throttle = Throttle::new(Some(1));
        let permit = throttle.try_admit();
        assert!(permit.is_some());
        assert!(throttle.try_admit().is_none());

        drop(permit);
        assert!(throttle.try_admit().is_some());
    }

    #[test]
    fn closed_throttle_refuses() {
        let throttle = Throttle::new(Some(4));
        throttle.close();
        assert!(throttle.try_admit().is_none());
    }
}
