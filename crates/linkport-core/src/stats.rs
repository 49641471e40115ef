//! Read-only management snapshots.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::Serialize;

use crate::state::ConnectionState;

/// Point-in-time view of a listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListenerStats {
    /// Debug URL of the listener.
    pub url: String,
    /// Worker tasks currently running link code.
    pub thread_count: usize,
    /// Acceptors parked in accept.
    pub idle_thread_count: usize,
    /// Acceptors scheduled but not yet parked.
    pub start_thread_count: usize,
    /// Workers blocked in a keepalive read.
    pub keepalive_thread_count: usize,
    /// Keepalive slots held.
    pub keepalive_count: usize,
    /// Keepalive connections parked in the select manager.
    pub keepalive_select_count: usize,
    /// Links with a connection (not idle, not destroyed).
    pub active_connection_count: usize,
    /// Suspended comet links.
    pub comet_idle_count: usize,
    /// Closed links waiting for reuse.
    pub free_list_count: usize,
    /// Lifetime counters.
    pub lifetime: LifetimeSnapshot,
}

/// Lifetime counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LifetimeSnapshot {
    /// Requests dispatched.
    pub request_count: u64,
    /// Requests that ended in a keepalive wait.
    pub keepalive_count: u64,
    /// Keepalive waits handed to the select manager.
    pub keepalive_select_count: u64,
    /// Connections ended by the client.
    pub client_disconnect_count: u64,
    /// Total time spent in request handling.
    pub request_time: Duration,
    /// Bytes read from all connections.
    pub read_bytes: u64,
    /// Bytes written to all connections.
    pub write_bytes: u64,
}

/// Monotonic lifetime counters shared by every link of a listener.
#[derive(Debug, Default)]
pub struct LifetimeCounters {
    requests: AtomicU64,
    keepalives: AtomicU64,
    keepalive_selects: AtomicU64,
    client_disconnects: AtomicU64,
    request_micros: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
}

impl LifetimeCounters {
    /// Count one dispatched request.
    pub fn add_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one keepalive wait.
    pub fn add_keepalive(&self) {
        self.keepalives.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one select hand-off.
    pub fn add_keepalive_select(&self) {
        self.keepalive_selects.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one client disconnect.
    pub fn add_client_disconnect(&self) {
        self.client_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Add time spent handling a request.
    pub fn add_request_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.request_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Add bytes moved by a closed connection.
    pub fn add_bytes(&self, read: u64, written: u64) {
        self.read_bytes.fetch_add(read, Ordering::Relaxed);
        self.write_bytes.fetch_add(written, Ordering::Relaxed);
    }

    /// Snapshot all counters.
    pub fn snapshot(&self) -> LifetimeSnapshot {
        LifetimeSnapshot {
            request_count: self.requests.load(Ordering::Relaxed),
            keepalive_count: self.keepalives.load(Ordering::Relaxed),
            keepalive_select_count: self.keepalive_selects.load(Ordering::Relaxed),
            client_disconnect_count: self.client_disconnects.load(Ordering::Relaxed),
            request_time: Duration::from_micros(self.request_micros.load(Ordering::Relaxed)),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Diagnostic view of one link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    /// Link id, unique for the listener's lifetime.
    pub id: u64,
    /// Worker currently driving the link, if any.
    pub worker_id: Option<u64>,
    /// Peer address of the current connection.
    pub remote_addr: Option<SocketAddr>,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Short activity label (`accept`, `read`, `duplex`, ...).
    pub display_state: &'static str,
    /// Time spent in the current request, when one is active.
    pub request_active_time: Option<Duration>,
    /// URL of the current request as reported by the protocol.
    pub request_url: Option<String>,
    /// Connection is TLS or marked secure.
    pub secure: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = LifetimeCounters::default();
        counters.add_request();
        counters.add_request();
        counters.add_keepalive();
        counters.add_bytes(10, 20);
        counters.add_bytes(1, 2);
        counters.add_request_time(Duration::from_millis(3));

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.keepalive_count, 1);
        assert_eq!(snapshot.read_bytes, 11);
        assert_eq!(snapshot.write_bytes, 22);
        assert_eq!(snapshot.request_time, Duration::from_millis(3));
    }
}
