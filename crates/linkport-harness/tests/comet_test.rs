//! Comet (long-poll) integration tests.
//!
//! Suspension, wake, timeout, and complete, including the races where the
//! controller is used before the handler returns.

use std::time::Duration;

use linkport_core::ListenerConfig;
use linkport_harness::{Event, TestServer, eventually, fixture::PATIENCE, test_config};

fn count(server: &TestServer, filter: impl Fn(&Event) -> bool) -> usize {
    server.protocol.count(filter)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn suspended_request_resumes_on_wake() {
    let server = TestServer::start(test_config()).unwrap();
    let mut client = server.connect().unwrap();

    client.send("comet").await.unwrap();
    let controller = server.protocol.next_controller(PATIENCE).await.unwrap();
    assert!(eventually(|| server.listener.stats().comet_idle_count == 1).await);

    assert!(controller.wake());
    assert_eq!(client.read_line().await.unwrap().as_deref(), Some("resumed"));
    assert!(eventually(|| controller.is_complete()).await);
    assert_eq!(server.listener.stats().comet_idle_count, 0);

    // the connection stays alive after the comet request
    assert_eq!(client.request("echo after").await.unwrap().as_deref(), Some("after"));
    assert_eq!(count(&server, |e| matches!(e, Event::Resumed(_))), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn suspended_request_times_out_once() {
    let server = TestServer::start(test_config()).unwrap();
    let mut client = server.connect().unwrap();

    client.send("comet 50").await.unwrap();
    let controller = server.protocol.next_controller(PATIENCE).await.unwrap();
    assert_eq!(client.read_line().await.unwrap().as_deref(), Some("timeout"));
    assert!(client.is_closed().await);

    assert!(!controller.wake());
    assert_eq!(count(&server, |e| matches!(e, Event::TimedOut(_))), 1);
    assert_eq!(count(&server, |e| matches!(e, Event::Resumed(_))), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn suspension_is_capped_by_suspend_time_max() {
    let config = ListenerConfig { suspend_time_max: Duration::from_millis(50), ..test_config() };
    let server = TestServer::start(config).unwrap();
    let mut client = server.connect().unwrap();

    client.send("comet 60000").await.unwrap();
    assert_eq!(client.read_line().await.unwrap().as_deref(), Some("timeout"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wake_before_return_skips_suspension() {
    let server = TestServer::start(test_config()).unwrap();
    let mut client = server.connect().unwrap();

    assert_eq!(client.request("comet-wake").await.unwrap().as_deref(), Some("resumed"));
    assert_eq!(client.request("echo next").await.unwrap().as_deref(), Some("next"));
    assert_eq!(count(&server, |e| matches!(e, Event::Resumed(_))), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn complete_before_return_keeps_connection() {
    let server = TestServer::start(test_config()).unwrap();
    let mut client = server.connect().unwrap();

    assert_eq!(client.request("comet-complete").await.unwrap().as_deref(), Some("completed"));
    assert_eq!(client.request("echo next").await.unwrap().as_deref(), Some("next"));
    assert_eq!(server.listener.stats().comet_idle_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn complete_without_comet_is_refused() {
    let server = TestServer::start(test_config()).unwrap();
    let mut client = server.connect().unwrap();

    assert_eq!(client.request("complete").await.unwrap().as_deref(), Some("illegal"));
    // the refusal leaves the request intact
    assert_eq!(client.request("echo next").await.unwrap().as_deref(), Some("next"));
    assert_eq!(server.protocol.count(|e| matches!(e, Event::Resumed(_))), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn complete_resumes_suspended_request() {
    let server = TestServer::start(test_config()).unwrap();
    let mut client = server.connect().unwrap();

    client.send("comet").await.unwrap();
    let controller = server.protocol.next_controller(PATIENCE).await.unwrap();
    assert!(eventually(|| server.listener.stats().comet_idle_count == 1).await);

    controller.complete().unwrap();
    assert_eq!(client.read_line().await.unwrap().as_deref(), Some("resumed"));
    assert!(eventually(|| controller.is_complete()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closing_suspended_request_closes_connection() {
    let server = TestServer::start(test_config()).unwrap();
    let mut client = server.connect().unwrap();

    client.send("comet").await.unwrap();
    let controller = server.protocol.next_controller(PATIENCE).await.unwrap();
    assert!(eventually(|| server.listener.stats().comet_idle_count == 1).await);

    controller.close();
    assert!(client.is_closed().await);
    assert!(eventually(|| count(&server, |e| matches!(e, Event::Closed(_))) == 1).await);
    assert_eq!(server.listener.stats().comet_idle_count, 0);
    assert!(!controller.wake());
    assert!(controller.is_complete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reaper_completes_suspended_request_after_peer_eof() {
    let config = ListenerConfig {
        suspend_close_time_max: Duration::from_millis(30),
        ..test_config()
    };
    let server = TestServer::start(config).unwrap();
    let mut client = server.connect().unwrap();

    client.send("comet").await.unwrap();
    let _controller = server.protocol.next_controller(PATIENCE).await.unwrap();
    assert!(eventually(|| server.listener.stats().comet_idle_count == 1).await);

    drop(client);
    assert!(eventually(|| count(&server, |e| matches!(e, Event::Resumed(_))) == 1).await);
    assert!(eventually(|| count(&server, |e| matches!(e, Event::Closed(_))) == 1).await);
}
