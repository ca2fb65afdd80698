//! Connection management of relay sessions

mod common;

use common::mock_relay::{MockNetworkStream, MockRelayTarget};
use relay_tunnel::network::{
    ErrorKind, NetworkStream, NoReplay, RelayError, RelaySession, SessionStatus, TransportError,
};
use std::sync::Arc;

#[tokio::test]
async fn test_fresh_connect_stores_sid() {
    let target = MockRelayTarget::new();
    let stream = MockNetworkStream::connected("abc123");
    target.add_connect(stream.clone());

    let session = RelaySession::new(target.clone());
    assert_eq!(session.status(), SessionStatus::New);
    assert_eq!(session.sid(), None);

    let connection = session.get_connection(&NoReplay).await.unwrap();

    assert_eq!(session.sid().as_deref(), Some("abc123"));
    assert_eq!(session.status(), SessionStatus::Connected);
    assert_eq!(target.connect_calls(), 1);
    assert_eq!(target.reconnect_calls(), 0);
    assert!(stream.written().is_empty(), "Nothing should be replayed");

    let expected: Arc<dyn NetworkStream> = stream;
    assert!(Arc::ptr_eq(&connection, &expected));
}

#[tokio::test]
async fn test_live_connection_is_reused() {
    let target = MockRelayTarget::new();
    target.add_connect(MockNetworkStream::connected("abc123"));

    let session = RelaySession::new(target.clone());
    let first = session.get_connection(&NoReplay).await.unwrap();
    let second = session.get_connection(&NoReplay).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(target.connect_calls(), 1);
}

#[tokio::test]
async fn test_handshake_skips_unknown_and_deprecated_tags() {
    let target = MockRelayTarget::new();
    let stream = MockNetworkStream::new();
    stream.push_message(vec![0x00, 0x03, 0xAA]);
    stream.push_message(vec![0x12, 0x34, 0x00, 0x00]);
    stream.push_message(common::ack_message(5));
    stream.push_message(common::sid_message("abc123"));
    target.add_connect(stream);

    let session = RelaySession::new(target);
    session.get_connection(&NoReplay).await.unwrap();

    assert_eq!(session.sid().as_deref(), Some("abc123"));
}

#[tokio::test]
async fn test_zero_read_during_handshake_is_a_normal_close() {
    let target = MockRelayTarget::new();
    let stream = MockNetworkStream::new();
    stream.push_close(1000, "");
    target.add_connect(stream.clone());

    let session = RelaySession::new(target);
    let error = session.get_connection(&NoReplay).await.unwrap_err();

    assert!(matches!(
        error,
        RelayError::Transport(TransportError::ClosedByServer { code: 1000, .. })
    ));
    assert_eq!(session.status(), SessionStatus::Disconnected);
    assert!(stream.is_closed(), "Failed handshakes release the connection");
}

#[tokio::test]
async fn test_one_byte_handshake_message_is_a_protocol_violation() {
    let target = MockRelayTarget::new();
    let stream = MockNetworkStream::new();
    stream.push_message(vec![0x00]);
    target.add_connect(stream);

    let session = RelaySession::new(target);
    let error = session.get_connection(&NoReplay).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ProtocolViolation);
}

#[tokio::test]
async fn test_truncated_sid_is_a_protocol_violation() {
    let target = MockRelayTarget::new();
    let stream = MockNetworkStream::new();
    let mut message = common::sid_message("abc123");
    message.truncate(message.len() - 2);
    stream.push_message(message);
    target.add_connect(stream);

    let session = RelaySession::new(target);
    let error = session.get_connection(&NoReplay).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ProtocolViolation);
    assert_eq!(session.sid(), None);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_handshake() {
    let target = MockRelayTarget::new();
    target.add_connect(MockNetworkStream::connected("abc123"));
    target.add_connect(MockNetworkStream::connected("unused"));

    let session = Arc::new(RelaySession::new(target.clone()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let session = Arc::clone(&session);
        handles.push(tokio::spawn(async move {
            session.get_connection(&NoReplay).await.unwrap()
        }));
    }

    let mut connections = Vec::new();
    for handle in handles {
        connections.push(handle.await.unwrap());
    }

    assert_eq!(target.connect_calls(), 1);
    assert!(connections
        .iter()
        .all(|connection| Arc::ptr_eq(connection, &connections[0])));
    assert_eq!(session.sid().as_deref(), Some("abc123"));
}

#[tokio::test]
async fn test_disconnect_keeps_sid() {
    let target = MockRelayTarget::new();
    let stream = MockNetworkStream::connected("abc123");
    target.add_connect(stream.clone());

    let session = RelaySession::new(target);
    session.get_connection(&NoReplay).await.unwrap();
    session.disconnect().await;

    assert!(stream.is_closed());
    assert_eq!(session.status(), SessionStatus::Disconnected);
    assert_eq!(session.sid().as_deref(), Some("abc123"));
}

#[tokio::test]
async fn test_reconnect_uses_sid_and_bytes_received() {
    let target = MockRelayTarget::new();
    target.add_connect(MockNetworkStream::connected("abc123"));
    let resumed = MockNetworkStream::reconnected(10);
    target.add_reconnect(resumed.clone());

    let session = RelaySession::new(target.clone());
    session.get_connection(&NoReplay).await.unwrap();

    session.state().reserve_bytes_sent(10);
    session.state().record_ack_received(10);
    session.state().add_bytes_received(42);
    session.disconnect().await;

    let connection = session.get_connection(&NoReplay).await.unwrap();

    let expected: Arc<dyn NetworkStream> = resumed;
    assert!(Arc::ptr_eq(&connection, &expected));
    assert_eq!(target.connect_calls(), 1);
    assert_eq!(target.reconnect_args(), vec![("abc123".to_string(), 42)]);
    assert_eq!(session.state().last_ack_sent(), 42);
    assert_eq!(session.sid().as_deref(), Some("abc123"));
}

#[tokio::test]
async fn test_connect_success_during_reconnect_is_a_protocol_violation() {
    let target = MockRelayTarget::new();
    target.add_connect(MockNetworkStream::connected("abc123"));
    target.add_reconnect(MockNetworkStream::connected("other"));

    let session = RelaySession::new(target);
    session.get_connection(&NoReplay).await.unwrap();
    session.state().reserve_bytes_sent(10);
    session.state().record_ack_received(10);
    session.disconnect().await;

    let error = session.get_connection(&NoReplay).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ProtocolViolation);
    assert_eq!(session.sid().as_deref(), Some("abc123"));
}

#[tokio::test]
async fn test_reconnect_ack_beyond_bytes_sent_is_a_protocol_violation() {
    let target = MockRelayTarget::new();
    target.add_connect(MockNetworkStream::connected("abc123"));
    target.add_reconnect(MockNetworkStream::reconnected(500));

    let session = RelaySession::new(target);
    session.get_connection(&NoReplay).await.unwrap();
    session.state().reserve_bytes_sent(10);
    session.state().record_ack_received(10);
    session.disconnect().await;

    let error = session.get_connection(&NoReplay).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ProtocolViolation);
}

#[tokio::test]
async fn test_disconnect_if_current_ignores_replaced_connection() {
    let target = MockRelayTarget::new();
    let first = MockNetworkStream::connected("abc123");
    let second = MockNetworkStream::reconnected(0);
    target.add_connect(first.clone());
    target.add_reconnect(second.clone());

    let session = RelaySession::new(target);
    let old = session.get_connection(&NoReplay).await.unwrap();
    assert!(session.disconnect_if_current(&old).await);

    session.get_connection(&NoReplay).await.unwrap();
    assert!(!session.disconnect_if_current(&old).await);

    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(session.status(), SessionStatus::Connected);
}

#[tokio::test]
async fn test_stale_connection_is_replaced() {
    let target = MockRelayTarget::new();
    let first = MockNetworkStream::connected("abc123");
    target.add_connect(first.clone());
    target.add_reconnect(MockNetworkStream::reconnected(0));

    let session = RelaySession::new(target.clone());
    let old = session.get_connection(&NoReplay).await.unwrap();
    session.mark_stale();
    let new = session.get_connection(&NoReplay).await.unwrap();

    assert!(!Arc::ptr_eq(&old, &new));
    assert!(first.is_closed());
    assert_eq!(target.connect_calls(), 1);
    assert_eq!(target.reconnect_args(), vec![("abc123".to_string(), 0)]);
}

#[tokio::test]
async fn test_session_with_sid_is_resumed_before_first_ack() {
    let target = MockRelayTarget::new();
    target.add_connect(MockNetworkStream::connected("abc123"));
    let resumed = MockNetworkStream::reconnected(0);
    target.add_reconnect(resumed.clone());

    let session = RelaySession::new(target.clone());
    session.get_connection(&NoReplay).await.unwrap();
    session.state().add_bytes_received(5);
    session.disconnect().await;
    assert_eq!(session.state().last_ack_received(), 0);

    let connection = session.get_connection(&NoReplay).await.unwrap();

    let expected: Arc<dyn NetworkStream> = resumed;
    assert!(Arc::ptr_eq(&connection, &expected));
    assert_eq!(target.connect_calls(), 1);
    assert_eq!(target.reconnect_args(), vec![("abc123".to_string(), 5)]);
    assert_eq!(session.sid().as_deref(), Some("abc123"));
}

#[tokio::test]
async fn test_cancelled_handshake_leaves_session_disconnected() {
    let target = MockRelayTarget::new();
    // Never sends CONNECT_SUCCESS_SID.
    target.add_connect(MockNetworkStream::new());

    let session = RelaySession::new(target.clone());
    let result = tokio::time::timeout(
        std::time::Duration::from_millis(50),
        session.get_connection(&NoReplay),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(session.status(), SessionStatus::Disconnected);
    assert_eq!(session.sid(), None);
}

#[tokio::test]
async fn test_close_is_terminal() {
    let target = MockRelayTarget::new();
    let stream = MockNetworkStream::connected("abc123");
    target.add_connect(stream.clone());

    let session = RelaySession::new(target.clone());
    session.get_connection(&NoReplay).await.unwrap();
    session.close().await;

    assert!(stream.is_closed());
    assert_eq!(session.status(), SessionStatus::Closed);

    let error = session.get_connection(&NoReplay).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::LocalClosure);
    assert_eq!(target.connect_calls(), 1);
}

#[tokio::test]
async fn test_display_shows_sid_prefix_and_counters() {
    let target = MockRelayTarget::new();
    target.add_connect(MockNetworkStream::connected("0123456789abcdef"));

    let session = RelaySession::new(target);
    assert!(session.to_string().starts_with("- "));

    session.get_connection(&NoReplay).await.unwrap();
    session.state().reserve_bytes_sent(7);

    let rendered = session.to_string();
    assert!(rendered.starts_with("01234567 "), "{}", rendered);
    assert!(rendered.contains("TX=7"), "{}", rendered);
}
