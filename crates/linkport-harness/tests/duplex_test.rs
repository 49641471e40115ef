//! Duplex upgrade integration tests.

use linkport_harness::{Event, TestServer, eventually, test_config};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upgraded_connection_is_driven_by_duplex_handler() {
    let server = TestServer::start(test_config()).unwrap();
    let mut client = server.connect().unwrap();

    assert_eq!(client.request("upgrade").await.unwrap().as_deref(), Some("upgraded"));
    // the upgrade gives up the keepalive slot
    assert!(eventually(|| server.listener.stats().keepalive_count == 0).await);

    assert_eq!(client.request("hello").await.unwrap().as_deref(), Some("duplex:hello"));
    assert_eq!(client.request("world").await.unwrap().as_deref(), Some("duplex:world"));

    client.send("quit").await.unwrap();
    assert!(client.is_closed().await);
    assert!(
        eventually(|| server.protocol.count(|e| matches!(e, Event::DuplexCompleted(_))) == 1)
            .await
    );
    assert_eq!(server.protocol.count(|e| matches!(e, Event::DuplexRead(_, _))), 3);
    // requests after the upgrade never reach the request handler
    assert_eq!(server.protocol.count(|e| matches!(e, Event::Request(_, _))), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplex_peer_close_completes_handler() {
    let server = TestServer::start(test_config()).unwrap();
    let mut client = server.connect().unwrap();

    assert_eq!(client.request("upgrade").await.unwrap().as_deref(), Some("upgraded"));
    drop(client);

    assert!(
        eventually(|| server.protocol.count(|e| matches!(e, Event::DuplexCompleted(_))) == 1)
            .await
    );
    assert!(eventually(|| server.protocol.count(|e| matches!(e, Event::Closed(_))) == 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipelined_duplex_lines_reach_on_read_one_by_one() {
    let server = TestServer::start(test_config()).unwrap();
    let mut client = server.connect().unwrap();

    assert_eq!(client.request("upgrade").await.unwrap().as_deref(), Some("upgraded"));
    client.send("one\ntwo").await.unwrap();

    // the second line sits in the read buffer and still wakes the handler
    assert_eq!(client.read_line().await.unwrap().as_deref(), Some("duplex:one"));
    assert_eq!(client.read_line().await.unwrap().as_deref(), Some("duplex:two"));

    let link_id = server
        .protocol
        .events()
        .iter()
        .find_map(|e| match e {
            Event::Request(id, _) => Some(*id),
            _ => None,
        })
        .unwrap();
    let reads: Vec<Event> = server
        .protocol
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::DuplexRead(_, _)))
        .collect();
    assert_eq!(
        reads,
        vec![
            Event::DuplexRead(link_id, "one".to_string()),
            Event::DuplexRead(link_id, "two".to_string()),
        ]
    );
}
