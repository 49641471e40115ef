//! Slot conservation properties
//!
//! Drives arbitrary event sequences through the transition table against a
//! shared [`KeepaliveSlots`] counter, the same way the link runtime does.
//! Illegal events are skipped, exactly as a defect would be rejected without
//! changing state.

use std::time::{Duration, Instant};

use linkport_core::{ConnectionState, KeepalivePolicy, KeepaliveSlots, LinkEvent, SlotAction};
use proptest::prelude::*;

fn event() -> impl Strategy<Value = LinkEvent> {
    proptest::sample::select(LinkEvent::ALL.to_vec())
}

/// Apply `event` the way the runtime does: a refused allocation turns a
/// dispatch into a non-keepalive one and leaves anything else unapplied.
fn drive(
    state: ConnectionState,
    event: LinkEvent,
    slots: &KeepaliveSlots,
    max: usize,
) -> ConnectionState {
    let Ok(transition) = state.transition(event) else {
        return state;
    };

    if transition.slot == SlotAction::Allocate {
        if slots.try_allocate(max) {
            return transition.next;
        }
        if !matches!(event, LinkEvent::Dispatch { .. }) {
            return state;
        }
        let Ok(fallback) = state.transition(LinkEvent::Dispatch { keepalive: false }) else {
            return state;
        };
        assert!(slots.apply(fallback.slot, max));
        return fallback.next;
    }

    assert!(slots.apply(transition.slot, max), "{state} --{event}--> {}", transition.next);
    transition.next
}

proptest! {
    #[test]
    fn single_link_holds_slot_iff_state_says_so(
        events in proptest::collection::vec(event(), 0..64),
    ) {
        let slots = KeepaliveSlots::new();
        let mut state = ConnectionState::Init;

        for event in events {
            state = drive(state, event, &slots, 8);
            prop_assert_eq!(slots.allocated(), usize::from(state.is_keepalive_allocated()));
        }

        state = drive(state, LinkEvent::Destroy, &slots, 8);
        prop_assert_eq!(state, ConnectionState::Destroyed);
        prop_assert_eq!(slots.allocated(), 0);
    }

    #[test]
    fn shared_counter_never_exceeds_max(
        max in 0usize..6,
        steps in proptest::collection::vec((0usize..12, event()), 0..256),
    ) {
        let slots = KeepaliveSlots::new();
        let mut links = vec![ConnectionState::Init; 12];

        for (index, event) in steps {
            links[index] = drive(links[index], event, &slots, max);
            prop_assert!(slots.allocated() <= max);

            let held = links.iter().filter(|s| s.is_keepalive_allocated()).count();
            prop_assert_eq!(slots.allocated(), held);
        }

        for link in &mut links {
            *link = drive(*link, LinkEvent::Destroy, &slots, max);
        }
        prop_assert_eq!(slots.allocated(), 0);
    }

    #[test]
    fn admission_never_grants_past_capacity(max in 1usize..16, holders in 0usize..32) {
        let slots = KeepaliveSlots::new();
        for _ in 0..holders {
            let _ = slots.try_allocate(max);
        }
        let policy = KeepalivePolicy { max, connection_time_max: Duration::from_secs(60) };
        let now = Instant::now();

        let below = slots.allocated() < max;
        prop_assert_eq!(policy.allows(&slots, now, now), below);
    }
}

#[test]
fn keepalive_denial_scenario() {
    let max = 10;
    let slots = KeepaliveSlots::new();
    let policy = KeepalivePolicy { max, connection_time_max: Duration::from_secs(600) };
    let now = Instant::now();

    let mut holders = Vec::new();
    for _ in 0..max {
        let allowed = policy.allows(&slots, now, now);
        assert!(allowed);
        let state = drive(
            ConnectionState::RequestRead,
            LinkEvent::Dispatch { keepalive: allowed },
            &slots,
            max,
        );
        assert_eq!(state, ConnectionState::RequestActiveKa);
        holders.push(state);
    }
    assert_eq!(slots.allocated(), 10);

    let allowed = policy.allows(&slots, now, now);
    assert!(!allowed);
    let eleventh = drive(
        ConnectionState::RequestRead,
        LinkEvent::Dispatch { keepalive: allowed },
        &slots,
        max,
    );
    assert_eq!(eleventh, ConnectionState::RequestActiveNka);

    let closed = drive(eleventh, LinkEvent::Close, &slots, max);
    assert_eq!(closed, ConnectionState::Closed);
    assert_eq!(slots.allocated(), 10);
}
