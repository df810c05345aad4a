//! Integration tests for the connection state machine and correlator
//!
//! A channel-backed transport stands in for the socket; the test plays the
//! server side by reading client frames and writing server frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hass_api::{Command, Event};
use hass_stream::{
    Connection, ConnectionConfig, ConnectionError, ConnectionPhase, FrameHandler, Transport,
    TransportError,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

// ============================================================================
// Test Helpers
// ============================================================================

struct ChannelTransport {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
    closed: bool,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.outgoing.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        if self.closed {
            return None;
        }
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

/// The server end of a [`ChannelTransport`]
struct FakeServer {
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl FakeServer {
    fn send(&self, frame: Value) {
        if let Some(tx) = &self.to_client {
            tx.send(frame.to_string()).unwrap();
        }
    }

    fn send_raw(&self, frame: &str) {
        if let Some(tx) = &self.to_client {
            tx.send(frame.to_string()).unwrap();
        }
    }

    async fn next_frame(&mut self) -> Value {
        let frame = timeout(Duration::from_secs(1), self.from_client.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client transport dropped");
        serde_json::from_str(&frame).unwrap()
    }

    /// Simulate the server going away
    fn disconnect(&mut self) {
        self.to_client = None;
    }
}

fn channel_pair() -> (Box<dyn Transport>, FakeServer) {
    let (to_client, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_client) = mpsc::unbounded_channel();
    let transport = ChannelTransport {
        incoming,
        outgoing,
        closed: false,
    };
    let server = FakeServer {
        to_client: Some(to_client),
        from_client,
    };
    (Box::new(transport), server)
}

fn test_config() -> ConnectionConfig {
    ConnectionConfig::new("hass.test", "test-token").with_request_timeout(Some(Duration::from_secs(2)))
}

/// Connect with the standard `auth_required` / `auth_ok` exchange
async fn connected() -> (Arc<Connection>, FakeServer, mpsc::UnboundedReceiver<Event>) {
    let (transport, mut server) = channel_pair();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    server.send(json!({"type": "auth_required", "ha_version": "2024.3.0"}));
    server.send(json!({"type": "auth_ok", "ha_version": "2024.3.0"}));

    let connection = Connection::with_transport(test_config(), transport, Arc::new(events_tx))
        .await
        .unwrap();

    let auth = server.next_frame().await;
    assert_eq!(auth, json!({"type": "auth", "access_token": "test-token"}));

    (Arc::new(connection), server, events_rx)
}

fn success(id: u64, result: Value) -> Value {
    json!({"id": id, "type": "result", "success": true, "result": result})
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_reaches_ready() {
    let (connection, _server, _events) = connected().await;
    assert_eq!(connection.phase(), ConnectionPhase::Ready);
    assert_eq!(connection.ha_version().as_deref(), Some("2024.3.0"));
}

#[tokio::test]
async fn test_auth_ok_without_challenge() {
    let (transport, mut server) = channel_pair();
    let (events_tx, _events_rx) = mpsc::unbounded_channel::<Event>();
    server.send(json!({"type": "auth_ok"}));

    let connection = Connection::with_transport(test_config(), transport, Arc::new(events_tx))
        .await
        .unwrap();
    assert!(connection.is_ready());

    // no auth frame was needed
    let pending = timeout(Duration::from_millis(50), server.from_client.recv()).await;
    assert!(pending.is_err());
}

#[tokio::test]
async fn test_auth_invalid_fails() {
    let (transport, server) = channel_pair();
    let (events_tx, _events_rx) = mpsc::unbounded_channel::<Event>();
    server.send(json!({"type": "auth_required"}));
    server.send(json!({"type": "auth_invalid", "message": "Invalid access token or password"}));

    let result = Connection::with_transport(test_config(), transport, Arc::new(events_tx)).await;
    match result {
        Err(ConnectionError::AuthFailed(message)) => {
            assert_eq!(message, "Invalid access token or password")
        }
        other => panic!("expected AuthFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_closing_during_handshake() {
    let (transport, mut server) = channel_pair();
    let (events_tx, _events_rx) = mpsc::unbounded_channel::<Event>();
    server.send(json!({"type": "auth_required"}));
    server.disconnect();

    let result = Connection::with_transport(test_config(), transport, Arc::new(events_tx)).await;
    assert!(matches!(result, Err(ConnectionError::Protocol(_))));
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let (transport, _server) = channel_pair();
    let (events_tx, _events_rx) = mpsc::unbounded_channel::<Event>();
    let config = ConnectionConfig::new("hass.test", "");

    let result = Connection::with_transport(config, transport, Arc::new(events_tx)).await;
    assert!(matches!(result, Err(ConnectionError::Configuration(_))));
}

// ============================================================================
// Correlation
// ============================================================================

#[tokio::test]
async fn test_responses_matched_out_of_order() {
    let (connection, mut server, _events) = connected().await;

    let first = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.call_command(Command::GetStates, None).await }
    });
    let first_frame = server.next_frame().await;

    let second = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.call_command(Command::GetConfig, None).await }
    });
    let second_frame = server.next_frame().await;

    assert_eq!(first_frame["type"], "get_states");
    assert_eq!(second_frame["type"], "get_config");
    let first_id = first_frame["id"].as_u64().unwrap();
    let second_id = second_frame["id"].as_u64().unwrap();
    assert!(second_id > first_id);

    server.send(success(second_id, json!({"version": "2024.3.0"})));
    server.send(success(first_id, json!([])));

    assert_eq!(first.await.unwrap().unwrap(), json!([]));
    assert_eq!(second.await.unwrap().unwrap(), json!({"version": "2024.3.0"}));
    assert_eq!(connection.pending_count(), 0);
}

#[tokio::test]
async fn test_concurrent_commands_resolve_exactly_once() {
    const CALLS: usize = 25;
    let (connection, mut server, _events) = connected().await;

    let mut handles = Vec::new();
    for _ in 0..CALLS {
        let connection = Arc::clone(&connection);
        handles.push(tokio::spawn(async move {
            connection.call_command(Command::Ping, None).await
        }));
    }

    let mut ids = Vec::new();
    for _ in 0..CALLS {
        let frame = server.next_frame().await;
        ids.push(frame["id"].as_u64().unwrap());
    }
    // ids reach the wire strictly increasing
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(ids[0], 1);

    for id in ids.iter().rev() {
        server.send(success(*id, json!(id)));
    }

    let mut results: Vec<u64> = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap().as_u64().unwrap());
    }
    results.sort_unstable();
    ids.sort_unstable();
    assert_eq!(results, ids);
    assert_eq!(connection.pending_count(), 0);
}

#[tokio::test]
async fn test_unknown_id_is_ignored() {
    let (connection, mut server, _events) = connected().await;

    let call = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.call_command(Command::GetServices, None).await }
    });
    let frame = server.next_frame().await;
    let id = frame["id"].as_u64().unwrap();

    server.send(success(id + 100, json!("stray")));
    server.send(success(id, json!("mine")));

    assert_eq!(call.await.unwrap().unwrap(), json!("mine"));
    assert!(connection.is_ready());
}

#[tokio::test]
async fn test_command_failure_is_reported() {
    let (connection, mut server, _events) = connected().await;

    let call = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move {
            connection
                .call_command(
                    Command::call_service("light", "explode", Some("light.desk"), Default::default()),
                    None,
                )
                .await
        }
    });
    let frame = server.next_frame().await;
    server.send(json!({
        "id": frame["id"],
        "type": "result",
        "success": false,
        "error": {"code": "not_found", "message": "Service not found."}
    }));

    match call.await.unwrap() {
        Err(ConnectionError::CommandFailed { code, .. }) => assert_eq!(code, "not_found"),
        other => panic!("expected CommandFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timeout_removes_pending_entry() {
    let (connection, mut server, _events) = connected().await;

    let result = connection
        .call_command(Command::GetStates, Some(Duration::from_millis(20)))
        .await;
    let id = match result {
        Err(ConnectionError::RequestTimeout { id, timeout }) => {
            assert_eq!(timeout, Duration::from_millis(20));
            id
        }
        other => panic!("expected RequestTimeout, got {:?}", other),
    };
    assert_eq!(connection.pending_count(), 0);

    // the late response is dropped and the connection keeps working
    let frame = server.next_frame().await;
    assert_eq!(frame["id"].as_u64(), Some(id));
    server.send(success(id, json!([])));

    let ping = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.ping(None).await }
    });
    let frame = server.next_frame().await;
    server.send(json!({"id": frame["id"], "type": "pong"}));
    assert!(ping.await.unwrap().is_ok());
}

// ============================================================================
// Receive loop
// ============================================================================

#[tokio::test]
async fn test_events_forwarded_in_order() {
    let (_connection, server, mut events) = connected().await;

    for n in 0..5 {
        server.send(json!({
            "id": 1,
            "type": "event",
            "event": {"event_type": "counter", "data": {"n": n}}
        }));
    }

    for n in 0..5 {
        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        assert_eq!(event.event_type, "counter");
        assert_eq!(event.data["n"], json!(n));
    }
}

#[tokio::test]
async fn test_server_ping_is_answered() {
    let (_connection, mut server, _events) = connected().await;

    server.send(json!({"id": 77, "type": "ping"}));
    assert_eq!(server.next_frame().await, json!({"id": 77, "type": "pong"}));
}

#[tokio::test]
async fn test_unrecognized_frames_are_ignored() {
    let (connection, mut server, _events) = connected().await;

    server.send_raw("definitely not json");
    server.send(json!({"type": "something_new", "id": 3}));

    let ping = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.ping(None).await }
    });
    let frame = server.next_frame().await;
    server.send(json!({"id": frame["id"], "type": "pong"}));
    assert!(ping.await.unwrap().is_ok());
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_disconnect_fails_all_pending() {
    let (connection, mut server, _events) = connected().await;

    let mut handles = Vec::new();
    for _ in 0..3 {
        let connection = Arc::clone(&connection);
        handles.push(tokio::spawn(async move {
            connection.call_command(Command::GetStates, None).await
        }));
    }
    for _ in 0..3 {
        server.next_frame().await;
    }

    server.disconnect();

    for handle in handles {
        assert!(matches!(
            handle.await.unwrap(),
            Err(ConnectionError::ConnectionClosed)
        ));
    }
    timeout(Duration::from_secs(1), connection.closed()).await.unwrap();
    assert_eq!(connection.phase(), ConnectionPhase::Closed);
    assert_eq!(connection.pending_count(), 0);

    assert!(matches!(
        connection.call_command(Command::Ping, None).await,
        Err(ConnectionError::NotConnected(ConnectionPhase::Closed))
    ));
}

struct CloseRecorder {
    closed: mpsc::UnboundedSender<()>,
}

impl FrameHandler for CloseRecorder {
    fn on_event(&self, _event: Event) {}

    fn on_closed(&self) {
        let _ = self.closed.send(());
    }
}

#[tokio::test]
async fn test_explicit_close_notifies_handler() {
    let (transport, server) = channel_pair();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    server.send(json!({"type": "auth_ok"}));

    let connection = Connection::with_transport(
        test_config(),
        transport,
        Arc::new(CloseRecorder { closed: closed_tx }),
    )
    .await
    .unwrap();

    let mut phases = connection.watch_phase();
    connection.close().await;

    assert_eq!(*phases.borrow_and_update(), ConnectionPhase::Closed);
    timeout(Duration::from_secs(1), closed_rx.recv()).await.unwrap().unwrap();
}
