//! Keepalive select hand-off integration tests.

use std::{sync::Arc, time::Duration};

use linkport_core::ListenerConfig;
use linkport_harness::{TestServer, eventually, test_config};
use linkport_server::{ReactorSelectManager, SelectManager};

fn select_config() -> ListenerConfig {
    ListenerConfig {
        keepalive_select_enable: true,
        keepalive_select_thread_timeout: Duration::from_millis(20),
        ..test_config()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_keepalive_is_handed_to_select_manager() {
    let select = Arc::new(ReactorSelectManager::new(16));
    let manager: Arc<dyn SelectManager> = Arc::clone(&select) as Arc<dyn SelectManager>;
    let server = TestServer::start_with(select_config(), Some(manager)).unwrap();
    let mut client = server.connect().unwrap();

    assert_eq!(client.request("echo 1").await.unwrap().as_deref(), Some("1"));
    assert!(eventually(|| server.listener.stats().keepalive_select_count == 1).await);
    assert_eq!(select.watched(), 1);
    assert_eq!(server.listener.stats().keepalive_thread_count, 0);

    // data on a selected connection goes back to a worker
    assert_eq!(client.request("echo 2").await.unwrap().as_deref(), Some("2"));
    assert!(server.listener.stats().lifetime.keepalive_select_count >= 1);
    assert_eq!(server.listener.stats().lifetime.request_count, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn declined_hand_off_falls_back_to_worker_wait() {
    let select: Arc<dyn SelectManager> = Arc::new(ReactorSelectManager::new(0));
    let server = TestServer::start_with(select_config(), Some(select)).unwrap();
    let mut client = server.connect().unwrap();

    assert_eq!(client.request("echo 1").await.unwrap().as_deref(), Some("1"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = server.listener.stats();
    assert_eq!(stats.keepalive_select_count, 0);
    assert_eq!(stats.keepalive_thread_count, 1);

    assert_eq!(client.request("echo 2").await.unwrap().as_deref(), Some("2"));
    assert_eq!(server.listener.stats().lifetime.keepalive_select_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn selected_connection_closes_on_peer_eof() {
    let select: Arc<dyn SelectManager> = Arc::new(ReactorSelectManager::new(16));
    let server = TestServer::start_with(select_config(), Some(select)).unwrap();
    let mut client = server.connect().unwrap();

    assert_eq!(client.request("echo 1").await.unwrap().as_deref(), Some("1"));
    assert!(eventually(|| server.listener.stats().keepalive_select_count == 1).await);

    drop(client);
    assert!(eventually(|| server.listener.stats().keepalive_select_count == 0).await);
    assert!(eventually(|| server.listener.stats().keepalive_count == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listener_close_closes_selected_connections() {
    let select: Arc<dyn SelectManager> = Arc::new(ReactorSelectManager::new(16));
    let server = TestServer::start_with(select_config(), Some(select)).unwrap();
    let mut client = server.connect().unwrap();

    assert_eq!(client.request("echo 1").await.unwrap().as_deref(), Some("1"));
    assert!(eventually(|| server.listener.stats().keepalive_select_count == 1).await);

    server.listener.close().await;
    assert!(client.is_closed().await);
    assert_eq!(server.listener.stats().keepalive_select_count, 0);
}
