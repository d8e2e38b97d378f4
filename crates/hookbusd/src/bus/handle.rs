//! Client interface for interacting with the BusActor.
//!
//! The `BusHandle` is a cheap-to-clone handle shared by the server, every
//! connection task and the heartbeat generator.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `BusError::ChannelClosed`

use std::collections::BTreeSet;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use hookbus_core::{Envelope, Normalized};
use hookbus_protocol::BusStatus;

use super::commands::{BusCommand, BusError, Outbox};
use crate::metrics::ProcessMetrics;

/// Handle for interacting with the bus actor.
#[derive(Clone, Debug)]
pub struct BusHandle {
    sender: mpsc::Sender<BusCommand>,
}

impl BusHandle {
    pub fn new(sender: mpsc::Sender<BusCommand>) -> Self {
        Self { sender }
    }

    /// Registers a client; the welcome and replay frames are queued on
    /// `outbox` before this returns.
    ///
    /// # Errors
    ///
    /// - `BusError::TooManyClients` if the client limit is reached
    /// - `BusError::ChannelClosed` if the actor has shut down
    pub async fn connect(
        &self,
        client_id: Option<String>,
        channels: BTreeSet<String>,
        outbox: Outbox,
        kick: CancellationToken,
    ) -> Result<String, BusError> {
        let (tx, rx) = oneshot::channel();
        self.send(BusCommand::Connect {
            client_id,
            channels,
            outbox,
            kick,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| BusError::ChannelClosed)?
    }

    /// Removes a client. Fire-and-forget.
    pub async fn disconnect(&self, client_id: &str) {
        let _ = self
            .sender
            .send(BusCommand::Disconnect {
                client_id: client_id.to_string(),
            })
            .await;
    }

    /// Stores and broadcasts a normalized event.
    ///
    /// Returns once the actor has queued the command, not after delivery.
    pub async fn publish(&self, normalized: Normalized, channel: Option<String>) -> Result<(), BusError> {
        self.send(BusCommand::Publish {
            normalized: Box::new(normalized),
            channel,
        })
        .await
    }

    /// Adds subscriptions; returns the client's full channel set.
    pub async fn subscribe(&self, client_id: &str, channels: Vec<String>) -> Result<Vec<String>, BusError> {
        let (tx, rx) = oneshot::channel();
        self.send(BusCommand::Subscribe {
            client_id: client_id.to_string(),
            channels,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| BusError::ChannelClosed)?
    }

    /// Removes subscriptions; returns the client's remaining channel set.
    pub async fn unsubscribe(&self, client_id: &str, channels: Vec<String>) -> Result<Vec<String>, BusError> {
        let (tx, rx) = oneshot::channel();
        self.send(BusCommand::Unsubscribe {
            client_id: client_id.to_string(),
            channels,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| BusError::ChannelClosed)?
    }

    /// Most recent `limit` events (all when `None`), oldest first.
    pub async fn history(&self, limit: Option<usize>, channel: Option<String>) -> Result<Vec<Envelope>, BusError> {
        let (tx, rx) = oneshot::channel();
        self.send(BusCommand::GetHistory {
            limit,
            channel,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| BusError::ChannelClosed)
    }

    pub async fn status(&self) -> Result<BusStatus, BusError> {
        let (tx, rx) = oneshot::channel();
        self.send(BusCommand::GetStatus { respond_to: tx }).await?;
        rx.await.map_err(|_| BusError::ChannelClosed)
    }

    /// Asks the actor to publish a heartbeat built from `metrics`.
    pub async fn heartbeat(&self, metrics: ProcessMetrics) -> Result<(), BusError> {
        self.send(BusCommand::Heartbeat { metrics }).await
    }

    /// Closes every client and stops the actor. Fire-and-forget.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(BusCommand::Shutdown).await;
    }

    async fn send(&self, cmd: BusCommand) -> Result<(), BusError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| BusError::ChannelClosed)
    }
}
