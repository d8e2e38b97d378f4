//! Bus actor - owns all bus state and processes commands.
//!
//! The BusActor is the single dispatcher of the system: history buffer,
//! client table, session table and counters live here and are only touched
//! from its task. Client I/O happens elsewhere; the actor hands each client
//! pre-serialized frames through a bounded queue and never waits on it.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Reply send failures are ignored (the requester went away)
//! - Full or closed client queues drop that client, nothing else

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hookbus_core::{channel_matches, Envelope, Normalized, Route};
use hookbus_protocol::{BusMessage, BusStatus};

use super::commands::{encode, BusCommand, BusError, Frame, Outbox};
use super::history::{HistoryBuffer, DEFAULT_HISTORY_CAPACITY};
use super::sessions::{HookProcessor, SessionTable};
use crate::config::BusConfig;
use crate::metrics::ProcessMetrics;

/// Default maximum number of connected clients.
pub const DEFAULT_MAX_CLIENTS: usize = 64;

/// Event type of generic session lifecycle events.
const SESSION_EVENT_TYPE: &str = "session";

// ============================================================================
// Settings
// ============================================================================

/// Parameters the actor is created with.
#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Identity reported in status, health and heartbeats
    pub server_id: String,
    pub history_capacity: usize,
    pub max_clients: usize,
    pub session_ttl: Duration,
}

impl BusSettings {
    pub fn from_config(config: &BusConfig, server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            history_capacity: config.history_capacity,
            max_clients: config.max_clients,
            session_ttl: config.session_ttl(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            server_id: String::from("hookbus"),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            max_clients: DEFAULT_MAX_CLIENTS,
            session_ttl: Duration::from_secs(3600),
        }
    }
}

// ============================================================================
// Bus Actor
// ============================================================================

struct ClientEntry {
    channels: BTreeSet<String>,
    connected_at: DateTime<Utc>,
    outbox: Outbox,
    kick: CancellationToken,
}

/// The bus actor.
///
/// Receives commands via mpsc channel and processes them sequentially.
pub struct BusActor {
    receiver: mpsc::Receiver<BusCommand>,
    settings: BusSettings,
    history: HistoryBuffer,
    clients: HashMap<String, ClientEntry>,
    sessions: SessionTable,
    /// Dedicated handler for hook-routed events
    hooks: Option<HookProcessor>,
    events_received: u64,
    started_at: Instant,
    next_client: u64,
}

impl BusActor {
    /// Creates an actor without a hook handler; hook events are stored
    /// like any other event.
    pub fn new(receiver: mpsc::Receiver<BusCommand>, settings: BusSettings) -> Self {
        Self {
            receiver,
            history: HistoryBuffer::new(settings.history_capacity),
            settings,
            clients: HashMap::new(),
            sessions: SessionTable::new(),
            hooks: None,
            events_received: 0,
            started_at: Instant::now(),
            next_client: 0,
        }
    }

    /// Registers the hook handler.
    #[must_use]
    pub fn with_hook_processor(mut self, processor: HookProcessor) -> Self {
        self.hooks = Some(processor);
        self
    }

    /// Runs the actor until `Shutdown` or until every handle is dropped.
    pub async fn run(mut self) {
        info!(
            server_id = %self.settings.server_id,
            history_capacity = self.history.capacity(),
            "Bus actor starting"
        );

        while let Some(cmd) = self.receiver.recv().await {
            if !self.handle_command(cmd) {
                break;
            }
        }

        self.close_all_clients();
        info!(
            events_received = self.events_received,
            history_size = self.history.len(),
            "Bus actor stopped"
        );
    }

    /// Dispatches a command. Returns false when the actor should stop.
    fn handle_command(&mut self, cmd: BusCommand) -> bool {
        match cmd {
            BusCommand::Connect {
                client_id,
                channels,
                outbox,
                kick,
                respond_to,
            } => {
                let result = self.handle_connect(client_id, channels, outbox, kick);
                let _ = respond_to.send(result);
            }
            BusCommand::Disconnect { client_id } => {
                if self.clients.remove(&client_id).is_some() {
                    debug!(client_id = %client_id, "Client disconnected");
                }
            }
            BusCommand::Publish {
                normalized,
                channel,
            } => {
                self.handle_publish(*normalized, channel);
            }
            BusCommand::Subscribe {
                client_id,
                channels,
                respond_to,
            } => {
                let result = self.update_subscriptions(&client_id, |set| {
                    set.extend(channels);
                });
                let _ = respond_to.send(result);
            }
            BusCommand::Unsubscribe {
                client_id,
                channels,
                respond_to,
            } => {
                let result = self.update_subscriptions(&client_id, |set| {
                    for channel in &channels {
                        set.remove(channel);
                    }
                });
                let _ = respond_to.send(result);
            }
            BusCommand::GetHistory {
                limit,
                channel,
                respond_to,
            } => {
                let _ = respond_to.send(self.history.snapshot(limit, channel.as_deref()));
            }
            BusCommand::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            BusCommand::Heartbeat { metrics } => {
                self.handle_heartbeat(metrics);
            }
            BusCommand::CleanupSessions => {
                self.handle_cleanup_sessions();
            }
            BusCommand::Shutdown => {
                info!(clients = self.clients.len(), "Bus shutdown requested");
                return false;
            }
        }
        true
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_connect(
        &mut self,
        requested: Option<String>,
        channels: BTreeSet<String>,
        outbox: Outbox,
        kick: CancellationToken,
    ) -> Result<String, BusError> {
        if self.clients.len() >= self.settings.max_clients {
            warn!(
                current = self.clients.len(),
                max = self.settings.max_clients,
                "Client limit reached, rejecting connection"
            );
            return Err(BusError::TooManyClients {
                max: self.settings.max_clients,
            });
        }

        let client_id = match requested {
            Some(id) if !id.is_empty() && !self.clients.contains_key(&id) => id,
            _ => self.fresh_client_id(),
        };

        // Welcome and replay go out before the client is visible to publish.
        let welcome = BusMessage::welcome(
            client_id.clone(),
            channels.iter().cloned().collect(),
            self.status(),
        );
        let replay = BusMessage::History {
            events: self.history.replay_for(&channels),
        };

        for msg in [welcome, replay] {
            let Some(frame) = encode(&msg) else {
                return Err(BusError::ChannelClosed);
            };
            if outbox.try_send(frame).is_err() {
                debug!(client_id = %client_id, "Client queue unavailable during connect");
                return Err(BusError::ChannelClosed);
            }
        }

        debug!(
            client_id = %client_id,
            channels = ?channels,
            "Client connected"
        );

        self.clients.insert(
            client_id.clone(),
            ClientEntry {
                channels,
                connected_at: Utc::now(),
                outbox,
                kick,
            },
        );

        Ok(client_id)
    }

    fn handle_publish(&mut self, normalized: Normalized, channel: Option<String>) {
        let Normalized {
            envelope, route, ..
        } = normalized;
        self.events_received = self.events_received.saturating_add(1);

        let now = Utc::now();
        match (route, self.hooks) {
            (Route::Hook, Some(hooks)) => hooks.process(&envelope, &mut self.sessions, now),
            (Route::Generic, Some(hooks)) if envelope.event_type == SESSION_EVENT_TYPE => {
                hooks.process_session_event(&envelope, &mut self.sessions, now);
            }
            _ => {}
        }

        let channel = channel
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| envelope.channel());
        self.record(channel, envelope);
    }

    fn handle_heartbeat(&mut self, metrics: ProcessMetrics) {
        let status = self.status();
        let sessions = serde_json::to_value(&status.active_sessions).unwrap_or(Value::Null);

        let mut data = Map::new();
        data.insert("server_id".into(), json!(status.server_id));
        data.insert("uptime_seconds".into(), json!(status.uptime_seconds));
        data.insert("connections".into(), json!(status.connections));
        data.insert("events_received".into(), json!(status.events_received));
        data.insert("history_size".into(), json!(status.history_size));
        data.insert("active_sessions".into(), sessions);
        data.insert("pid".into(), json!(metrics.pid));
        data.insert("memory_bytes".into(), json!(metrics.memory_bytes));
        data.insert("cpu_percent".into(), json!(metrics.cpu_percent));

        let envelope = Envelope::new("system", "heartbeat").with_data(data);
        debug!(
            connections = status.connections,
            events_received = status.events_received,
            "Publishing heartbeat"
        );
        self.record(envelope.channel(), envelope);
    }

    fn handle_cleanup_sessions(&mut self) {
        let ttl = chrono::Duration::from_std(self.settings.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let removed = self.sessions.expire(ttl, Utc::now());
        if removed > 0 {
            debug!(removed, remaining = self.sessions.len(), "Expired idle sessions");
        }
    }

    fn update_subscriptions<F>(&mut self, client_id: &str, update: F) -> Result<Vec<String>, BusError>
    where
        F: FnOnce(&mut BTreeSet<String>),
    {
        let entry = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| BusError::ClientNotFound(client_id.to_string()))?;
        update(&mut entry.channels);
        Ok(entry.channels.iter().cloned().collect())
    }

    // ========================================================================
    // Storage and Fan-out
    // ========================================================================

    /// Appends to history, then fans out to matching subscribers.
    fn record(&mut self, channel: String, envelope: Envelope) {
        let Some(frame) = encode(&BusMessage::Event {
            channel: channel.clone(),
            event: envelope.clone(),
        }) else {
            return;
        };

        self.history.push(channel.clone(), envelope);
        self.broadcast(&channel, &frame);
    }

    fn broadcast(&mut self, channel: &str, frame: &Frame) {
        let mut dropped = Vec::new();

        for (client_id, client) in &self.clients {
            if !client.channels.iter().any(|sub| channel_matches(sub, channel)) {
                continue;
            }
            match client.outbox.try_send(Arc::clone(frame)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(client_id = %client_id, "Client queue full, dropping client");
                    dropped.push(client_id.clone());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client_id = %client_id, "Client queue closed, dropping client");
                    dropped.push(client_id.clone());
                }
            }
        }

        for client_id in dropped {
            if let Some(client) = self.clients.remove(&client_id) {
                client.kick.cancel();
                debug!(
                    client_id = %client_id,
                    connected_for_secs = (Utc::now() - client.connected_at).num_seconds(),
                    "Dropped client"
                );
            }
        }
    }

    fn close_all_clients(&mut self) {
        for (_, client) in self.clients.drain() {
            client.kick.cancel();
        }
    }

    fn status(&self) -> BusStatus {
        BusStatus {
            server_id: self.settings.server_id.clone(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            connections: self.clients.len(),
            events_received: self.events_received,
            history_size: self.history.len(),
            history_capacity: self.history.capacity(),
            active_sessions: self.sessions.summaries(),
        }
    }

    fn fresh_client_id(&mut self) -> String {
        loop {
            self.next_client = self.next_client.wrapping_add(1);
            let id = format!("client-{}", self.next_client);
            if !self.clients.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::spawn_bus;
    use hookbus_core::route;
    use serde_json::json;
    use tokio::sync::mpsc::Receiver;

    fn settings(history_capacity: usize, max_clients: usize) -> BusSettings {
        BusSettings {
            server_id: "test-bus".to_string(),
            history_capacity,
            max_clients,
            session_ttl: Duration::from_secs(60),
        }
    }

    fn decode(frame: Frame) -> Value {
        serde_json::from_str(&frame).unwrap()
    }

    async fn next(rx: &mut Receiver<Frame>) -> Value {
        decode(rx.recv().await.unwrap())
    }

    fn all_channels() -> BTreeSet<String> {
        BTreeSet::from(["*".to_string()])
    }

    #[tokio::test]
    async fn test_connect_receives_welcome_then_history() {
        let bus = spawn_bus(settings(10, 4));
        bus.publish(route(&json!({"type": "agent.started"})), None).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let id = bus
            .connect(None, all_channels(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(id, "client-1");

        let welcome = next(&mut rx).await;
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["status"]["server_id"], "test-bus");

        let history = next(&mut rx).await;
        assert_eq!(history["type"], "history");
        assert_eq!(history["events"][0]["type"], "agent");
    }

    #[tokio::test]
    async fn test_fanout_respects_subscriptions() {
        let bus = spawn_bus(settings(10, 4));

        let (hook_tx, mut hook_rx) = mpsc::channel(16);
        let (sys_tx, mut sys_rx) = mpsc::channel(16);
        bus.connect(None, BTreeSet::from(["/hook".to_string()]), hook_tx, CancellationToken::new())
            .await
            .unwrap();
        bus.connect(None, BTreeSet::from(["/system".to_string()]), sys_tx, CancellationToken::new())
            .await
            .unwrap();
        // welcome + history
        for _ in 0..2 {
            next(&mut hook_rx).await;
            next(&mut sys_rx).await;
        }

        bus.publish(route(&json!({"type": "hook.pre_tool"})), None).await.unwrap();
        bus.publish(route(&json!({"type": "system.ping"})), None).await.unwrap();
        bus.status().await.unwrap();

        let event = next(&mut hook_rx).await;
        assert_eq!(event["channel"], "/hook");
        assert!(hook_rx.try_recv().is_err());

        let event = next(&mut sys_rx).await;
        assert_eq!(event["channel"], "/system");
        assert!(sys_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_client_is_dropped_without_blocking_others() {
        let bus = spawn_bus(settings(100, 4));

        // Room for welcome + history only.
        let (slow_tx, _slow_rx) = mpsc::channel(2);
        let slow_kick = CancellationToken::new();
        bus.connect(Some("slow".into()), all_channels(), slow_tx, slow_kick.clone())
            .await
            .unwrap();

        let (fast_tx, mut fast_rx) = mpsc::channel(64);
        bus.connect(Some("fast".into()), all_channels(), fast_tx, CancellationToken::new())
            .await
            .unwrap();

        for n in 0..5 {
            bus.publish(route(&json!({"type": "test.tick", "id": n})), None).await.unwrap();
        }

        let status = bus.status().await.unwrap();
        assert_eq!(status.connections, 1);
        assert!(slow_kick.is_cancelled());

        next(&mut fast_rx).await;
        next(&mut fast_rx).await;
        for n in 0..5 {
            let event = next(&mut fast_rx).await;
            assert_eq!(event["event"]["id"], n.to_string());
        }
    }

    #[tokio::test]
    async fn test_max_clients() {
        let bus = spawn_bus(settings(10, 1));
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        bus.connect(None, all_channels(), tx1, CancellationToken::new()).await.unwrap();
        let err = bus
            .connect(None, all_channels(), tx2, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, BusError::TooManyClients { max: 1 });
    }

    #[tokio::test]
    async fn test_hook_event_recorded_once_and_updates_session() {
        let bus = spawn_bus(settings(10, 4));
        let raw = json!({
            "type": "hook.session_start",
            "data": {"session_id": "s1", "agent": "Engineer"}
        });
        bus.publish(route(&raw), None).await.unwrap();

        let status = bus.status().await.unwrap();
        assert_eq!(status.events_received, 1);
        assert_eq!(status.history_size, 1);
        assert_eq!(status.active_sessions.len(), 1);
        assert_eq!(status.active_sessions[0].agent, "Engineer");
    }

    #[tokio::test]
    async fn test_explicit_channel_and_history_filter() {
        let bus = spawn_bus(settings(10, 4));
        bus.publish(route(&json!({"type": "note"})), Some("/custom".into())).await.unwrap();
        bus.publish(route(&json!({"type": "note"})), None).await.unwrap();

        assert_eq!(bus.history(None, Some("/custom".into())).await.unwrap().len(), 1);
        assert_eq!(bus.history(None, Some("/note".into())).await.unwrap().len(), 1);
        assert_eq!(bus.history(Some(1), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_published_on_system_channel() {
        let bus = spawn_bus(settings(10, 4));
        bus.heartbeat(ProcessMetrics::default()).await.unwrap();

        let history = bus.history(None, Some("/system".into())).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].qualified_name(), "system.heartbeat");
        assert_eq!(history[0].field_str("server_id"), Some("test-bus"));
        // heartbeats are not inbound events
        assert_eq!(bus.status().await.unwrap().events_received, 0);
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let bus = spawn_bus(settings(10, 4));
        let (tx, _rx) = mpsc::channel(8);
        let id = bus
            .connect(None, BTreeSet::new(), tx, CancellationToken::new())
            .await
            .unwrap();

        let channels = bus.subscribe(&id, vec!["/hook".into(), "/system".into()]).await.unwrap();
        assert_eq!(channels, vec!["/hook", "/system"]);
        let channels = bus.unsubscribe(&id, vec!["/hook".into()]).await.unwrap();
        assert_eq!(channels, vec!["/system"]);

        assert!(matches!(
            bus.subscribe("ghost", vec![]).await,
            Err(BusError::ClientNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_kicks_clients() {
        let bus = spawn_bus(settings(10, 4));
        let (tx, _rx) = mpsc::channel(8);
        let kick = CancellationToken::new();
        bus.connect(None, all_channels(), tx, kick.clone()).await.unwrap();

        bus.shutdown().await;
        kick.cancelled().await;
        assert!(bus.status().await.is_err());
    }
}
