//! Arbitrary event sequences against the connection state machine.
//!
//! Each input byte picks an event for one of four links sharing a keepalive
//! slot counter. After every step the counter must equal the number of links
//! whose state holds a slot, and never exceed the maximum.

#![no_main]

use libfuzzer_sys::fuzz_target;
use linkport_core::{ConnectionState, KeepaliveSlots, LinkEvent, SlotAction};

const LINKS: usize = 4;
const MAX: usize = 2;

fn step(state: ConnectionState, event: LinkEvent, slots: &KeepaliveSlots) -> ConnectionState {
    let Ok(transition) = state.transition(event) else {
        return state;
    };
    if transition.slot == SlotAction::Allocate && !slots.try_allocate(MAX) {
        if !matches!(event, LinkEvent::Dispatch { .. }) {
            return state;
        }
        let Ok(fallback) = state.transition(LinkEvent::Dispatch { keepalive: false }) else {
            return state;
        };
        assert!(slots.apply(fallback.slot, MAX));
        return fallback.next;
    }
    if transition.slot != SlotAction::Allocate {
        assert!(slots.apply(transition.slot, MAX), "{state} --{event}--> {}", transition.next);
    }
    transition.next
}

fuzz_target!(|data: &[u8]| {
    let slots = KeepaliveSlots::new();
    let mut links = [ConnectionState::Init; LINKS];

    for byte in data {
        let link = usize::from(byte >> 6) % LINKS;
        let event = LinkEvent::ALL[usize::from(byte & 0x3f) % LinkEvent::ALL.len()];
        links[link] = step(links[link], event, &slots);

        let held = links.iter().filter(|state| state.is_keepalive_allocated()).count();
        assert_eq!(slots.allocated(), held);
        assert!(held <= MAX);
    }

    for state in &mut links {
        *state = step(*state, LinkEvent::Destroy, &slots);
        assert!(state.is_destroyed());
    }
    assert_eq!(slots.allocated(), 0);
});
