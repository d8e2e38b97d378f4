//! Bus actor commands and errors.
//!
//! This module defines the message types for communicating with the `BusActor`:
//! - `BusCommand`: Commands sent to the actor
//! - `BusError`: Errors that can occur during bus operations
//! - `Outbox`: the per-client queue the actor fans events into

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::error;

use hookbus_core::{Envelope, Normalized};
use hookbus_protocol::{BusMessage, BusStatus};

use crate::metrics::ProcessMetrics;

/// Serialized outbound frame, shared between all recipients of a broadcast.
pub type Frame = Arc<str>;

/// Sending side of a client's outbound queue.
pub type Outbox = mpsc::Sender<Frame>;

/// Serializes a message into a shareable frame.
pub fn encode(msg: &BusMessage) -> Option<Frame> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            error!(error = %e, "Failed to serialize bus message");
            None
        }
    }
}

// ============================================================================
// Bus Commands
// ============================================================================

/// Commands sent to the bus actor.
///
/// Request/response commands carry a oneshot sender for the reply.
#[derive(Debug)]
pub enum BusCommand {
    /// Register a client connection.
    ///
    /// On success the actor queues `welcome` and the history replay on the
    /// outbox before any live event, then replies with the assigned id.
    ///
    /// # Errors
    /// - `BusError::TooManyClients` if `max_clients` are already connected
    Connect {
        /// Requested client id (a fresh one is assigned when absent or taken)
        client_id: Option<String>,
        /// Initial subscriptions
        channels: BTreeSet<String>,
        /// Client's outbound queue
        outbox: Outbox,
        /// Cancelled by the actor when the client is dropped
        kick: CancellationToken,
        respond_to: oneshot::Sender<Result<String, BusError>>,
    },

    /// Remove a client connection.
    Disconnect { client_id: String },

    /// Store and broadcast a normalized event.
    Publish {
        normalized: Box<Normalized>,
        /// Explicit channel; derived from the envelope type when absent
        channel: Option<String>,
    },

    /// Add channels to a client's subscriptions.
    Subscribe {
        client_id: String,
        channels: Vec<String>,
        respond_to: oneshot::Sender<Result<Vec<String>, BusError>>,
    },

    /// Remove channels from a client's subscriptions.
    Unsubscribe {
        client_id: String,
        channels: Vec<String>,
        respond_to: oneshot::Sender<Result<Vec<String>, BusError>>,
    },

    /// Read a slice of the history buffer.
    GetHistory {
        limit: Option<usize>,
        channel: Option<String>,
        respond_to: oneshot::Sender<Vec<Envelope>>,
    },

    /// Read current bus statistics.
    GetStatus { respond_to: oneshot::Sender<BusStatus> },

    /// Compose and publish a `system.heartbeat` event.
    Heartbeat { metrics: ProcessMetrics },

    /// Drop session records past their TTL.
    CleanupSessions,

    /// Close every client and stop the actor.
    Shutdown,
}

// ============================================================================
// Bus Errors
// ============================================================================

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// The bus has reached its client limit.
    #[error("too many clients (max: {max})")]
    TooManyClients { max: usize },

    /// The named client is not connected.
    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// The actor has shut down.
    #[error("bus channel closed")]
    ChannelClosed,
}
