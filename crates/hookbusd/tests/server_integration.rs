//! Integration tests for the WebSocket bus server.
//!
//! These tests run the real server on an ephemeral port and talk to it
//! over WebSockets: handshake, replay on connect, fan-out, hook routing
//! and the health endpoint.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use hookbus_protocol::{BusMessage, ClientMessage, MessageType, ProtocolVersion};
use hookbusd::bus::{spawn_bus, BusHandle, BusSettings};
use hookbusd::server::{EventBusServer, DEFAULT_HOST};

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for any single frame
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Window in which no frame is expected
const QUIET_PERIOD: Duration = Duration::from_millis(200);

// ============================================================================
// Test Helpers
// ============================================================================

struct TestServer {
    addr: SocketAddr,
    bus: BusHandle,
    cancel_token: CancellationToken,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(BusSettings::default(), None).await
    }

    async fn spawn_with(settings: BusSettings, token: Option<&str>) -> Self {
        let bus = spawn_bus(settings);
        let cancel_token = CancellationToken::new();
        let server = EventBusServer::bind(
            SocketAddr::from((DEFAULT_HOST, 0)),
            bus.clone(),
            token.map(str::to_string),
            cancel_token.clone(),
        )
        .await
        .expect("bind server");
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        Self {
            addr,
            bus,
            cancel_token,
        }
    }

    async fn open(&self) -> TestClient {
        let url = format!("ws://{}/ws", self.addr);
        let (ws, _) = connect_async(url).await.expect("websocket connect");
        TestClient { ws }
    }

    /// Connects and completes the handshake; returns the client plus the
    /// replayed history.
    async fn connect(&self, channels: Option<Vec<&str>>) -> (TestClient, Vec<Value>) {
        let mut client = self.open().await;
        let channels = channels.map(|c| c.into_iter().map(str::to_string).collect());
        client.send(&ClientMessage::connect(None, channels)).await;

        let welcome = client.recv().await;
        assert_eq!(welcome["type"], "welcome", "unexpected first frame: {welcome}");

        let history = client.recv().await;
        assert_eq!(history["type"], "history");
        let events = history["events"].as_array().cloned().unwrap_or_default();
        (client, events)
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn send(&mut self, msg: &ClientMessage) {
        let json = serde_json::to_string(msg).unwrap();
        self.ws.send(Message::Text(json)).await.unwrap();
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    async fn try_recv(&mut self, wait: Duration) -> Option<Value> {
        loop {
            let frame = timeout(wait, self.ws.next()).await.ok()??.ok()?;
            match frame {
                Message::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    async fn recv(&mut self) -> Value {
        self.try_recv(RECV_TIMEOUT).await.expect("frame from server")
    }

    /// Round-trips a ping so everything sent before it has been handled.
    async fn sync(&mut self, seq: u64) {
        self.send(&ClientMessage::ping(seq)).await;
        loop {
            let msg = self.recv().await;
            if msg["type"] == "pong" && msg["seq"] == seq {
                return;
            }
        }
    }
}

async fn producer(server: &TestServer) -> TestClient {
    let mut client = server.open().await;
    client.send(&ClientMessage::connect_producer(None, None)).await;
    assert_eq!(client.recv().await["type"], "welcome");
    assert_eq!(client.recv().await["type"], "history");
    client
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_welcome_then_history() {
    let server = TestServer::spawn().await;
    let mut client = server.open().await;
    client
        .send(&ClientMessage::connect(Some("dashboard".into()), None))
        .await;

    let welcome = client.recv().await;
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(welcome["client_id"], "dashboard");
    assert_eq!(welcome["channels"], json!(["*"]));
    assert_eq!(welcome["protocol_version"], "1.0");

    let history = client.recv().await;
    assert_eq!(history["type"], "history");
    assert_eq!(history["events"], json!([]));

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_version_mismatch_rejected() {
    let server = TestServer::spawn().await;
    let mut client = server.open().await;

    let mut msg = ClientMessage::connect(None, None);
    msg.protocol_version = ProtocolVersion::new(2, 0);
    client.send(&msg).await;

    let reply = client.recv().await;
    assert_eq!(reply["type"], "rejected");
    assert!(reply["reason"].as_str().unwrap().contains("2.0"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_requires_connect_first() {
    let server = TestServer::spawn().await;
    let mut client = server.open().await;
    client.send(&ClientMessage::get_status()).await;

    let reply = client.recv().await;
    assert_eq!(reply["type"], "rejected");

    server.shutdown().await;
}

#[tokio::test]
async fn test_token_required_when_configured() {
    let server = TestServer::spawn_with(BusSettings::default(), Some("s3cret")).await;

    let mut anonymous = server.open().await;
    anonymous.send(&ClientMessage::connect(None, None)).await;
    let reply = anonymous.recv().await;
    assert_eq!(reply["type"], "rejected");
    assert_eq!(reply["reason"], "Invalid token");

    let mut trusted = server.open().await;
    trusted
        .send(&ClientMessage::connect_producer(None, Some("s3cret".into())))
        .await;
    assert_eq!(trusted.recv().await["type"], "welcome");

    server.shutdown().await;
}

#[tokio::test]
async fn test_max_clients_rejects_extra_connection() {
    let settings = BusSettings {
        max_clients: 1,
        ..BusSettings::default()
    };
    let server = TestServer::spawn_with(settings, None).await;

    let (_first, _) = server.connect(None).await;

    let mut second = server.open().await;
    second.send(&ClientMessage::connect(None, None)).await;
    let reply = second.recv().await;
    assert_eq!(reply["type"], "rejected");

    server.shutdown().await;
}

// ============================================================================
// Replay and History
// ============================================================================

#[tokio::test]
async fn test_replay_on_connect_is_oldest_first() {
    let server = TestServer::spawn().await;
    let mut source = producer(&server).await;

    for n in 0..3 {
        source
            .send(&ClientMessage::claude_event(json!({"type": "agent.step", "n": n})))
            .await;
    }
    source.sync(1).await;

    let (_observer, history) = server.connect(None).await;
    let numbers: Vec<i64> = history.iter().map(|e| e["n"].as_i64().unwrap()).collect();
    assert_eq!(numbers, vec![0, 1, 2]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_history_is_bounded() {
    let settings = BusSettings {
        history_capacity: 5,
        ..BusSettings::default()
    };
    let server = TestServer::spawn_with(settings, None).await;
    let mut source = producer(&server).await;

    for n in 0..12 {
        source
            .send(&ClientMessage::claude_event(json!({"type": "agent.step", "n": n})))
            .await;
    }
    source.sync(1).await;

    let (mut observer, history) = server.connect(None).await;
    let numbers: Vec<i64> = history.iter().map(|e| e["n"].as_i64().unwrap()).collect();
    assert_eq!(numbers, vec![7, 8, 9, 10, 11]);

    observer
        .send(&ClientMessage::get_history(Some(2), None))
        .await;
    let reply = observer.recv().await;
    assert_eq!(reply["type"], "history");
    let numbers: Vec<i64> = reply["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["n"].as_i64().unwrap())
        .collect();
    assert_eq!(numbers, vec![10, 11]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_events_recorded_with_no_clients() {
    let server = TestServer::spawn().await;
    let mut source = producer(&server).await;
    source
        .send(&ClientMessage::claude_event(json!({"type": "system.note"})))
        .await;
    source.sync(1).await;

    let history = server.bus.history(None, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].qualified_name(), "system.note");

    server.shutdown().await;
}

// ============================================================================
// Fan-out
// ============================================================================

#[tokio::test]
async fn test_fanout_respects_channels() {
    let server = TestServer::spawn().await;
    let (mut hooks, _) = server.connect(Some(vec!["/hook"])).await;
    let (mut everything, _) = server.connect(None).await;
    let mut source = producer(&server).await;

    source
        .send(&ClientMessage::claude_event(json!({"type": "agent.step"})))
        .await;
    source
        .send(&ClientMessage::claude_event(json!({
            "type": "hook.pre_tool",
            "data": {"session_id": "s1", "tool_name": "Bash"}
        })))
        .await;

    let first = everything.recv().await;
    assert_eq!(first["type"], "event");
    assert_eq!(first["channel"], "/agent");
    let second = everything.recv().await;
    assert_eq!(second["channel"], "/hook");

    let only = hooks.recv().await;
    assert_eq!(only["channel"], "/hook");
    assert_eq!(only["event"]["subtype"], "pre_tool");
    assert_eq!(only["event"]["tool_name"], "Bash");
    assert!(hooks.try_recv(QUIET_PERIOD).await.is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn test_emit_on_explicit_channel() {
    let server = TestServer::spawn().await;
    let (mut observer, _) = server.connect(Some(vec!["/dashboard"])).await;
    let mut source = producer(&server).await;

    source
        .send(&ClientMessage::emit("/dashboard", json!({"type": "agent.step"})))
        .await;

    let msg = observer.recv().await;
    assert_eq!(msg["channel"], "/dashboard");
    assert_eq!(msg["event"]["type"], "agent");

    server.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_later() {
    let server = TestServer::spawn().await;
    let (mut observer, _) = server.connect(Some(vec![])).await;
    observer
        .send(&ClientMessage::subscribe(vec!["/system".into()]))
        .await;
    observer.sync(7).await;

    let mut source = producer(&server).await;
    source
        .send(&ClientMessage::claude_event(json!({"type": "system.note"})))
        .await;

    assert_eq!(observer.recv().await["channel"], "/system");

    server.shutdown().await;
}

// ============================================================================
// Hook routing
// ============================================================================

#[tokio::test]
async fn test_hook_event_counted_once_and_tracks_session() {
    let server = TestServer::spawn().await;
    let mut source = producer(&server).await;

    source
        .send(&ClientMessage::claude_event(json!({
            "type": "hook.subagent_start",
            "data": {"session_id": "abc", "agent": "planner"}
        })))
        .await;
    source.sync(1).await;

    let status = server.bus.status().await.unwrap();
    assert_eq!(status.events_received, 1);
    assert_eq!(status.history_size, 1);
    assert_eq!(status.active_sessions.len(), 1);
    assert_eq!(status.active_sessions[0].agent, "planner");

    server.shutdown().await;
}

#[tokio::test]
async fn test_protected_fields_survive_payload() {
    let server = TestServer::spawn().await;
    let (mut observer, _) = server.connect(None).await;
    let mut source = producer(&server).await;

    source
        .send(&ClientMessage::claude_event(json!({
            "type": "hook.pre_tool",
            "timestamp": "2026-01-01T00:00:00Z",
            "data": {"type": "evil", "timestamp": "never", "tool_name": "Read"}
        })))
        .await;

    let msg = observer.recv().await;
    let event = &msg["event"];
    assert_eq!(event["type"], "hook");
    assert_eq!(event["subtype"], "pre_tool");
    assert_eq!(event["timestamp"], "2026-01-01T00:00:00Z");
    assert_eq!(event["tool_name"], "Read");
    assert_eq!(event["data"]["type"], "evil");

    server.shutdown().await;
}

#[tokio::test]
async fn test_batch_is_acked() {
    let server = TestServer::spawn().await;
    let mut source = producer(&server).await;

    let batch = ClientMessage::new(MessageType::EmitBatch {
        events: vec![
            hookbus_protocol::ChannelEvent {
                channel: None,
                event: json!({"type": "agent.a"}),
            },
            hookbus_protocol::ChannelEvent {
                channel: Some("/custom".into()),
                event: json!({"type": "agent.b"}),
            },
        ],
    });
    source.send(&batch).await;

    let ack = source.recv().await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["accepted"], 2);

    let custom = server.bus.history(None, Some("/custom".into())).await.unwrap();
    assert_eq!(custom.len(), 1);

    server.shutdown().await;
}

// ============================================================================
// Robustness
// ============================================================================

#[tokio::test]
async fn test_malformed_message_keeps_connection() {
    let server = TestServer::spawn().await;
    let mut source = producer(&server).await;

    source.send_raw("{not json").await;
    let reply = source.recv().await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "invalid_message");

    source.sync(3).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_non_object_event_becomes_unknown() {
    let server = TestServer::spawn().await;
    let mut source = producer(&server).await;
    source.send(&ClientMessage::claude_event(json!(42))).await;
    source.sync(1).await;

    let history = server.bus.history(None, None).await.unwrap();
    assert_eq!(history[0].event_type, "unknown");

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let server = TestServer::spawn().await;
    let (mut observer, _) = server.connect(None).await;

    server.cancel_token.cancel();
    assert!(observer.try_recv(RECV_TIMEOUT).await.is_none());
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let server = TestServer::spawn().await;
    let port = server.addr.port();

    let report = tokio::task::spawn_blocking(move || {
        hookbusd::daemon::probe_health(port, Duration::from_secs(2))
    })
    .await
    .unwrap()
    .unwrap();

    assert!(report.is_healthy());
    assert_eq!(report.port, port);
    assert_eq!(report.server_id, "hookbus");

    server.shutdown().await;
}

#[tokio::test]
async fn test_status_request() {
    let server = TestServer::spawn().await;
    let (mut observer, _) = server.connect(None).await;

    observer.send(&ClientMessage::get_status()).await;
    let reply = observer.recv().await;
    assert_eq!(reply["type"], "status");
    assert_eq!(reply["status"]["connections"], 1);

    let parsed: BusMessage = serde_json::from_value(reply).unwrap();
    assert!(matches!(parsed, BusMessage::Status { .. }));

    server.shutdown().await;
}
