//! Protocol message types for bus communication.
//!
//! Every WebSocket text frame carries exactly one JSON message, tagged by
//! its `type` field.

use crate::version::ProtocolVersion;
use hookbus_core::{Envelope, SessionSummary};
use serde::{Deserialize, Serialize};

/// Event name producers use to submit events on the default channel.
pub const CLAUDE_EVENT: &str = "claude_event";

/// A raw event addressed to an explicit channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEvent {
    /// Target channel; derived from the normalized type when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// The raw, not yet normalized event
    pub event: serde_json::Value,
}

/// Message types that can be sent by clients to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake
    Connect {
        /// Client identifier (optional)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,

        /// Channels to subscribe to; `None` subscribes to every channel,
        /// an empty list to none (producer-only connections)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channels: Option<Vec<String>>,

        /// Shared secret, required when the bus is configured with one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Event submitted under the default event name
    ClaudeEvent {
        /// The raw event (to be normalized)
        event: serde_json::Value,
    },

    /// Event submitted on an explicit channel
    Emit {
        channel: String,
        event: serde_json::Value,
    },

    /// Several events in one frame (sent by the connection pool)
    EmitBatch { events: Vec<ChannelEvent> },

    /// Add channels to this connection's subscriptions
    Subscribe { channels: Vec<String> },

    /// Remove channels from this connection's subscriptions
    Unsubscribe { channels: Vec<String> },

    /// Request bus status
    GetStatus,

    /// Request a history replay
    GetHistory {
        /// Most recent `limit` events; all buffered events when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,

        /// Only events recorded on this channel
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },

    /// Ping to check connection
    Ping {
        /// Sequence number for matching pong response
        seq: u64,
    },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version
    #[serde(default)]
    pub protocol_version: ProtocolVersion,

    /// Message payload
    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    /// Creates an observer handshake subscribed to `channels` (all when `None`).
    pub fn connect(client_id: Option<String>, channels: Option<Vec<String>>) -> Self {
        Self::new(MessageType::Connect {
            client_id,
            channels,
            token: None,
        })
    }

    /// Creates a producer handshake with no subscriptions.
    pub fn connect_producer(client_id: Option<String>, token: Option<String>) -> Self {
        Self::new(MessageType::Connect {
            client_id,
            channels: Some(Vec::new()),
            token,
        })
    }

    /// Creates a default-channel event submission.
    pub fn claude_event(event: serde_json::Value) -> Self {
        Self::new(MessageType::ClaudeEvent { event })
    }

    /// Creates a per-channel event submission.
    pub fn emit(channel: impl Into<String>, event: serde_json::Value) -> Self {
        Self::new(MessageType::Emit {
            channel: channel.into(),
            event,
        })
    }

    /// Creates a batched event submission.
    pub fn emit_batch(events: Vec<ChannelEvent>) -> Self {
        Self::new(MessageType::EmitBatch { events })
    }

    /// Creates a subscribe message.
    pub fn subscribe(channels: Vec<String>) -> Self {
        Self::new(MessageType::Subscribe { channels })
    }

    /// Creates a status request.
    pub fn get_status() -> Self {
        Self::new(MessageType::GetStatus)
    }

    /// Creates a history request.
    pub fn get_history(limit: Option<usize>, channel: Option<String>) -> Self {
        Self::new(MessageType::GetHistory { limit, channel })
    }

    /// Creates a ping message.
    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    /// Creates a disconnect message.
    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Point-in-time bus statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusStatus {
    pub server_id: String,
    pub uptime_seconds: u64,
    pub connections: usize,
    pub events_received: u64,
    pub history_size: usize,
    pub history_capacity: usize,
    pub active_sessions: Vec<SessionSummary>,
}

/// Messages sent from the bus to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// Handshake accepted
    Welcome {
        protocol_version: ProtocolVersion,
        client_id: String,
        /// Channels this connection is subscribed to
        channels: Vec<String>,
        status: BusStatus,
    },

    /// Handshake rejected (version mismatch, bad token, too many clients)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// History replay, oldest first
    History { events: Vec<Envelope> },

    /// Live event on a subscribed channel
    Event { channel: String, event: Envelope },

    /// Response to `get_status`
    Status { status: BusStatus },

    /// Number of events accepted from a batch
    Ack { accepted: usize },

    /// Pong response to ping
    Pong { seq: u64 },

    /// Error response
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl BusMessage {
    /// Creates a welcome response.
    pub fn welcome(client_id: String, channels: Vec<String>, status: BusStatus) -> Self {
        Self::Welcome {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
            channels,
            status,
        }
    }

    /// Creates a rejected response.
    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    /// Creates an error response.
    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    /// Creates an error response with code.
    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }
}
