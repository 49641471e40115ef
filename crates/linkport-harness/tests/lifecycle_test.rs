//! Listener lifecycle and link reuse integration tests.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use linkport_core::{LifecycleState, ListenerConfig};
use linkport_harness::{Event, RecordingProtocol, TestServer, eventually, fixture::PATIENCE, test_config};
use linkport_server::{Listener, ListenerError, Protocol};

fn single_acceptor() -> ListenerConfig {
    ListenerConfig { accept_thread_min: 1, accept_thread_max: 1, ..test_config() }
}

fn request_link(server: &TestServer, request: &str) -> Option<u64> {
    server.protocol.events().iter().find_map(|e| match e {
        Event::Request(id, line) if line == request => Some(*id),
        _ => None,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closed_links_are_reused_with_their_connection_object() {
    // two connection places: the held connection and one more link
    let config = ListenerConfig { connection_max: 2, ..single_acceptor() };
    let server = TestServer::start(config).unwrap();

    let mut held = server.connect().unwrap();
    assert_eq!(held.request("echo a").await.unwrap().as_deref(), Some("a"));

    let mut closing = server.connect().unwrap();
    assert_eq!(closing.request("close").await.unwrap().as_deref(), Some("bye"));
    assert!(closing.is_closed().await);
    let closed_link = request_link(&server, "close").unwrap();

    // leaving the accept loop sends the closed link to the free list
    server.listener.stop();
    assert!(eventually(|| server.listener.stats().free_list_count == 1).await);
    server.listener.start().unwrap();
    assert!(eventually(|| server.listener.stats().free_list_count == 0).await);

    let mut reused = server.connect().unwrap();
    assert_eq!(reused.request("echo b").await.unwrap().as_deref(), Some("b"));
    assert_eq!(request_link(&server, "echo b"), Some(closed_link));

    let created = server.protocol.count(|e| matches!(e, Event::Created(id) if *id == closed_link));
    let started = server.protocol.count(|e| matches!(e, Event::Started(id) if *id == closed_link));
    assert_eq!(created, 1);
    assert_eq!(started, 2);
    assert_eq!(server.protocol.count(|e| matches!(e, Event::Created(_))), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_max_bounds_admitted_connections() {
    let config = ListenerConfig { connection_max: 2, ..test_config() };
    let server = TestServer::start(config).unwrap();

    let mut first = server.connect().unwrap();
    assert_eq!(first.request("echo a").await.unwrap().as_deref(), Some("a"));
    let mut second = server.connect().unwrap();
    assert_eq!(second.request("echo b").await.unwrap().as_deref(), Some("b"));

    let mut third = server.connect().unwrap();
    third.send("echo c").await.unwrap();
    assert!(third.read_line_within(Duration::from_millis(200)).await.is_err());
    assert_eq!(server.protocol.count(|e| matches!(e, Event::Created(_))), 2);

    // a closed connection frees its place for the waiting one
    assert_eq!(first.request("close").await.unwrap().as_deref(), Some("bye"));
    assert_eq!(third.read_line().await.unwrap().as_deref(), Some("c"));
    assert_eq!(server.protocol.count(|e| matches!(e, Event::Created(_))), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_controller_cannot_touch_reused_link() {
    let server = TestServer::start(single_acceptor()).unwrap();

    let mut first = server.connect().unwrap();
    first.send("comet").await.unwrap();
    let controller = server.protocol.next_controller(PATIENCE).await.unwrap();
    controller.close();
    assert!(first.is_closed().await);
    assert!(eventually(|| server.listener.stats().free_list_count == 1).await);

    let mut second = server.connect().unwrap();
    assert_eq!(second.request("echo a").await.unwrap().as_deref(), Some("a"));
    let mut third = server.connect().unwrap();
    assert_eq!(third.request("echo b").await.unwrap().as_deref(), Some("b"));

    assert!(controller.is_complete());
    assert!(!controller.wake());
    // stale completes are no-ops
    assert!(controller.complete().is_ok());
    assert_eq!(third.request("echo c").await.unwrap().as_deref(), Some("c"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_pauses_accepting_and_start_resumes() {
    let server = TestServer::start(test_config()).unwrap();
    let mut kept = server.connect().unwrap();
    assert!(server.listener.keepalive_allowed(Instant::now()));
    assert_eq!(kept.request("echo 1").await.unwrap().as_deref(), Some("1"));

    server.listener.stop();
    assert_eq!(server.listener.lifecycle(), LifecycleState::Stopped);
    assert!(eventually(|| server.listener.stats().idle_thread_count == 0).await);

    // a stopped listener answers the pending request without keepalive
    assert_eq!(kept.request("echo 2").await.unwrap().as_deref(), Some("2"));
    assert!(kept.is_closed().await);
    assert!(!server.listener.keepalive_allowed(Instant::now()));

    let mut late = server.connect().unwrap();
    late.send("echo x").await.unwrap();
    assert!(late.read_line_within(Duration::from_millis(200)).await.is_err());

    server.listener.start().unwrap();
    assert_eq!(late.read_line().await.unwrap().as_deref(), Some("x"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_tears_down_every_connection() {
    let server = TestServer::start(test_config()).unwrap();

    let mut keepalive = server.connect().unwrap();
    assert_eq!(keepalive.request("echo 1").await.unwrap().as_deref(), Some("1"));
    let mut suspended = server.connect().unwrap();
    suspended.send("comet").await.unwrap();
    let controller = server.protocol.next_controller(PATIENCE).await.unwrap();
    assert!(eventually(|| server.listener.stats().comet_idle_count == 1).await);

    server.listener.close().await;

    assert!(keepalive.is_closed().await);
    assert!(suspended.is_closed().await);
    assert_eq!(server.listener.lifecycle(), LifecycleState::Destroyed);
    assert_eq!(server.protocol.count(|e| matches!(e, Event::Closed(_))), 2);
    assert!(!controller.wake());

    let stats = server.listener.stats();
    assert_eq!(stats.comet_idle_count, 0);
    assert_eq!(stats.keepalive_count, 0);
    assert_eq!(stats.free_list_count, 0);
    assert!(matches!(server.listener.start(), Err(ListenerError::Closed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fatal_handler_error_is_published() {
    let server = TestServer::start(test_config()).unwrap();
    let mut fatal = server.listener.fatal_events();

    let mut client = server.connect().unwrap();
    client.send("fatal").await.unwrap();
    assert!(client.is_closed().await);

    tokio::time::timeout(PATIENCE, fatal.changed()).await.unwrap().unwrap();
    let event = fatal.borrow().clone().unwrap();
    let link_id = server
        .protocol
        .events()
        .iter()
        .find_map(|e| match e {
            Event::Request(id, line) if line == "fatal" => Some(*id),
            _ => None,
        })
        .unwrap();
    assert_eq!(event.link_id, link_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_panic_closes_only_its_connection() {
    let server = TestServer::start(test_config()).unwrap();

    let mut bystander = server.connect().unwrap();
    assert_eq!(bystander.request("echo 1").await.unwrap().as_deref(), Some("1"));

    let mut client = server.connect().unwrap();
    client.send("panic").await.unwrap();
    assert!(client.is_closed().await);

    assert_eq!(bystander.request("echo 2").await.unwrap().as_deref(), Some("2"));
    let mut next = server.connect().unwrap();
    assert_eq!(next.request("echo 3").await.unwrap().as_deref(), Some("3"));
    assert!(server.listener.fatal_events().borrow().is_none());
}

#[tokio::test]
async fn invalid_config_is_rejected_at_build() {
    let protocol: Arc<dyn Protocol> = RecordingProtocol::new();
    let config = ListenerConfig { accept_thread_min: 4, accept_thread_max: 2, ..test_config() };
    assert!(matches!(Listener::builder(config, protocol).build(), Err(ListenerError::Config(_))));
}

#[tokio::test]
async fn start_requires_bind() {
    let protocol: Arc<dyn Protocol> = RecordingProtocol::new();
    let listener = Listener::builder(test_config(), protocol).build().unwrap();
    assert!(matches!(listener.start(), Err(ListenerError::NotBound)));
    assert_eq!(listener.lifecycle(), LifecycleState::New);
}
