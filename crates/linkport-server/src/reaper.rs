//! Suspend reaper.
//!
//! Runs every `suspend-reaper-interval` over a snapshot of the suspend set:
//!
//! - a link past its idle expiry gets its one timeout resume
//! - a link suspended longer than `suspend-close-time-max` whose peer has
//!   closed is completed, so its handler can clean up

use std::{sync::Arc, time::Instant};

use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::listener::Shared;

pub(crate) async fn run(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.suspend_reaper_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        if shared.lifecycle.is_destroying() {
            break;
        }
        sweep(&shared, Instant::now());
    }
    trace!("suspend reaper stopped");
}

fn sweep(shared: &Shared, now: Instant) {
    let close_time_max = shared.config.suspend_close_time_max;
    for link in shared.suspended_snapshot() {
        if link.timeout_if_expired(now) {
            continue;
        }

        let idle_too_long = link.suspended_for(now).is_some_and(|idle| idle > close_time_max);
        if idle_too_long && link.is_read_eof() {
            debug!(link_id = link.id(), "suspended peer closed, completing");
            if let Err(e) = link.complete() {
                trace!(link_id = link.id(), error = %e, "complete after eof failed");
            }
        }
    }
}
