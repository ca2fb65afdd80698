//! Local bridge forwarding through scripted relays

mod common;

use common::mock_relay::{MockNetworkStream, MockRelayTarget};
use relay_tunnel::network::{pump, relay_io, AllowList, Bridge, BridgeEvent, RelayStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

async fn next_event(events: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> BridgeEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Timed out waiting for bridge event")
        .expect("Event channel closed")
}

#[tokio::test]
async fn test_bridge_forwards_both_directions() {
    let target = MockRelayTarget::new();
    let connection = MockNetworkStream::connected("abc123");
    target.add_connect(connection.clone());

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let bridge = Bridge::bind("127.0.0.1:0", target.clone())
        .await
        .unwrap()
        .with_events(events_tx);
    let addr = bridge.local_addr().unwrap();
    let statistics = bridge.statistics();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(bridge.run_until(async {
        let _ = shutdown_rx.await;
    }));

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        BridgeEvent::ClientConnected { client_id: 1, .. }
    ));

    client.write_all(b"SSH-2.0-test\r\n").await.unwrap();
    let written = connection.wait_for_writes(1).await;
    assert_eq!(written[0], common::data_message(b"SSH-2.0-test\r\n"));

    connection.push_message(common::data_message(b"SSH-2.0-server\r\n"));
    let mut buffer = [0u8; 16];
    client.read_exact(&mut buffer).await.unwrap();
    assert_eq!(&buffer, b"SSH-2.0-server\r\n");

    // The relay ends the stream, the client sees EOF.
    connection.push_close(1000, "");
    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    assert_eq!(
        next_event(&mut events).await,
        BridgeEvent::ClientDisconnected {
            client_id: 1,
            bytes_sent: 14,
            bytes_received: 16,
        }
    );
    assert_eq!(statistics.accepted(), 1);
    assert_eq!(statistics.bytes_sent(), 14);
    assert_eq!(statistics.bytes_received(), 16);

    shutdown_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bridge_rejects_clients_outside_policy() {
    let target = MockRelayTarget::new();

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let bridge = Bridge::bind("127.0.0.1:0", target.clone())
        .await
        .unwrap()
        .with_policy(Arc::new(AllowList(vec!["10.1.2.3".parse().unwrap()])))
        .with_events(events_tx);
    let addr = bridge.local_addr().unwrap();
    let statistics = bridge.statistics();
    let server = tokio::spawn(bridge.run());

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        BridgeEvent::ClientRejected { .. }
    ));

    let mut buffer = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buffer))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(statistics.rejected(), 1);
    assert_eq!(target.connect_calls(), 0);

    server.abort();
}

#[tokio::test]
async fn test_bridge_reports_relay_failures() {
    let target = MockRelayTarget::new();
    // Reader and writer side may each attempt a connection.
    for _ in 0..2 {
        let connection = MockNetworkStream::new();
        connection.push_close(4033, "not authorized");
        target.add_connect(connection);
    }

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let bridge = Bridge::bind("127.0.0.1:0", target.clone())
        .await
        .unwrap()
        .with_events(events_tx);
    let addr = bridge.local_addr().unwrap();
    let server = tokio::spawn(bridge.run());

    let mut client = TcpStream::connect(addr).await.unwrap();
    next_event(&mut events).await;

    client.write_all(b"hello").await.unwrap();
    match next_event(&mut events).await {
        BridgeEvent::ClientFailed { client_id, kind, .. } => {
            assert_eq!(client_id, 1);
            assert_eq!(kind, Some(relay_tunnel::network::ErrorKind::AccessDenied));
        }
        other => panic!("Unexpected event: {:?}", other),
    }

    server.abort();
}

#[tokio::test]
async fn test_relay_io_exposes_stream_as_duplex() {
    let target = MockRelayTarget::new();
    let connection = MockNetworkStream::connected("abc123");
    target.add_connect(connection.clone());

    let relay = Arc::new(RelayStream::new(target));
    let mut io = relay_io(Arc::clone(&relay));

    io.write_all(b"hello").await.unwrap();
    let written = connection.wait_for_writes(1).await;
    assert_eq!(written[0], common::data_message(b"hello"));

    connection.push_message(common::data_message(b"world"));
    let mut buffer = [0u8; 5];
    io.read_exact(&mut buffer).await.unwrap();
    assert_eq!(&buffer, b"world");

    drop(io);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !connection.is_closed() {
        assert!(tokio::time::Instant::now() < deadline, "Relay was not closed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_pump_stops_when_client_closes() {
    let target = MockRelayTarget::new();
    let connection = MockNetworkStream::connected("abc123");
    target.add_connect(connection.clone());

    let relay = Arc::new(RelayStream::new(target));
    let client = tokio_test::io::Builder::new().read(b"ping").build();

    tokio::time::timeout(Duration::from_secs(5), pump(client, Arc::clone(&relay)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(connection.written(), vec![common::data_message(b"ping")]);
    assert!(connection.is_closed());
    assert_eq!(relay.bytes_sent(), 4);
}

#[tokio::test]
async fn test_pump_forwards_reply_after_client_half_close() {
    let target = MockRelayTarget::new();
    let connection = MockNetworkStream::connected("abc123");
    target.add_connect(connection.clone());

    let relay = Arc::new(RelayStream::new(target));
    let (mut local, remote) = tokio::io::duplex(1024);
    let task = tokio::spawn(pump(remote, Arc::clone(&relay)));

    local.write_all(b"ping").await.unwrap();
    local.shutdown().await.unwrap();
    connection.wait_for_writes(1).await;

    connection.push_message(common::data_message(b"pong"));
    let mut reply = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), local.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"pong");

    connection.push_close(1000, "");
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(connection.is_closed());
    assert_eq!(relay.bytes_received(), 4);
}
