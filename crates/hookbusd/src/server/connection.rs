//! Connection handler for individual WebSocket clients.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs the `connect` handshake (version, token, subscriptions)
//! - Normalizes inbound events and forwards them to the bus
//! - Answers status, history and ping requests
//!
//! Outbound traffic goes through a bounded per-client queue drained by a
//! writer task, so the bus never waits on a socket.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::BTreeSet;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hookbus_core::{route, WILDCARD_CHANNEL};
use hookbus_protocol::{BusMessage, ClientMessage, MessageType, ProtocolVersion};

use super::AppState;
use crate::bus::{encode, BusError, Frame, Outbox};

/// Maximum inbound message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Per-client outbound queue capacity
pub const OUTBOX_CAPACITY: usize = 256;

/// Time allowed between upgrade and the `connect` message
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Write timeout per frame
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Accepted handshake parameters.
struct Hello {
    client_id: Option<String>,
    channels: BTreeSet<String>,
}

/// Connection handler for a single client.
pub struct ConnectionHandler {
    state: AppState,
    connection_number: u64,
    client_id: Option<String>,
}

impl ConnectionHandler {
    pub fn new(state: AppState, connection_number: u64) -> Self {
        Self {
            state,
            connection_number,
            client_id: None,
        }
    }

    /// Runs the connection until the client leaves, is dropped by the bus,
    /// or the server shuts down.
    pub async fn run(mut self, socket: WebSocket) {
        debug!(connection = self.connection_number, "New client connected");
        let (mut sink, mut stream) = socket.split();

        let hello = match self.handle_handshake(&mut sink, &mut stream).await {
            Ok(hello) => hello,
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                let _ = sink.close().await;
                return;
            }
        };

        let (outbox, queue) = mpsc::channel(OUTBOX_CAPACITY);
        let kick = self.state.cancel.child_token();
        let writer = tokio::spawn(write_frames(sink, queue, kick.clone()));

        let client_id = match self
            .state
            .bus
            .connect(hello.client_id, hello.channels, outbox.clone(), kick.clone())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(connection = self.connection_number, error = %e, "Bus refused client");
                if let Some(frame) = encode(&BusMessage::rejected(&e.to_string())) {
                    let _ = outbox.try_send(frame);
                }
                drop(outbox);
                let _ = writer.await;
                return;
            }
        };

        self.client_id = Some(client_id.clone());
        info!(client_id = %client_id, "Client handshake completed");

        if let Err(e) = self.process_messages(&mut stream, &outbox, &kick).await {
            debug!(client_id = %client_id, error = %e, "Connection closed");
        }

        self.state.bus.disconnect(&client_id).await;
        kick.cancel();
        drop(outbox);
        let _ = timeout(WRITE_TIMEOUT, writer).await;

        info!(client_id = %client_id, "Client disconnected");
    }

    /// Expects a `connect` message, validates version and token.
    async fn handle_handshake(
        &mut self,
        sink: &mut WsSink,
        stream: &mut WsStream,
    ) -> Result<Hello, ConnectionError> {
        let text = match timeout(HANDSHAKE_TIMEOUT, next_text(stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout),
        };

        let msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                send_direct(sink, &BusMessage::rejected("Expected connect message")).await?;
                return Err(ConnectionError::Parse(e.to_string()));
            }
        };

        if let Err(e) = ProtocolVersion::negotiate(msg.protocol_version) {
            warn!(
                client_version = %msg.protocol_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            send_direct(sink, &BusMessage::rejected(&e.to_string())).await?;
            return Err(ConnectionError::VersionMismatch {
                client: msg.protocol_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect {
                client_id,
                channels,
                token,
            } => {
                if let Some(expected) = self.state.auth_token.as_deref() {
                    if token.as_deref() != Some(expected) {
                        send_direct(sink, &BusMessage::rejected("Invalid token")).await?;
                        return Err(ConnectionError::Unauthorized);
                    }
                }

                let channels = match channels {
                    Some(list) => list.into_iter().filter(|c| !c.is_empty()).collect(),
                    None => BTreeSet::from([WILDCARD_CHANNEL.to_string()]),
                };
                Ok(Hello { client_id, channels })
            }
            other => {
                send_direct(sink, &BusMessage::rejected("Expected connect message")).await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Reads and processes messages until the connection ends.
    async fn process_messages(
        &mut self,
        stream: &mut WsStream,
        outbox: &Outbox,
        kick: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        loop {
            let text = tokio::select! {
                _ = kick.cancelled() => {
                    debug!(client_id = ?self.client_id, "Client kicked by bus");
                    return Ok(());
                }
                result = next_text(stream) => match result {
                    Ok(text) => text,
                    Err(ConnectionError::Eof) => return Ok(()),
                    Err(ConnectionError::MessageTooLarge { size, max }) => {
                        reply(outbox, &BusMessage::error_with_code(
                            &format!("Message too large ({size} > {max} bytes)"),
                            "message_too_large",
                        )).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            let msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(client_id = ?self.client_id, error = %e, "Unparseable message");
                    reply(
                        outbox,
                        &BusMessage::error_with_code(&format!("Invalid message: {e}"), "invalid_message"),
                    )
                    .await?;
                    continue;
                }
            };

            if !self.handle_message(msg.message, outbox).await? {
                return Ok(());
            }
        }
    }

    /// Handles one message. Returns false if the client asked to leave.
    async fn handle_message(&mut self, msg: MessageType, outbox: &Outbox) -> Result<bool, ConnectionError> {
        let bus = &self.state.bus;
        let client_id = self.client_id.as_deref().unwrap_or_default();

        match msg {
            MessageType::ClaudeEvent { event } => {
                bus.publish(route(&event), None).await?;
            }
            MessageType::Emit { channel, event } => {
                bus.publish(route(&event), Some(channel)).await?;
            }
            MessageType::EmitBatch { events } => {
                let mut accepted = 0;
                for item in events {
                    bus.publish(route(&item.event), item.channel).await?;
                    accepted += 1;
                }
                reply(outbox, &BusMessage::Ack { accepted }).await?;
            }
            MessageType::Subscribe { channels } => {
                let now = bus.subscribe(client_id, channels).await?;
                debug!(client_id, channels = ?now, "Subscriptions updated");
            }
            MessageType::Unsubscribe { channels } => {
                let now = bus.unsubscribe(client_id, channels).await?;
                debug!(client_id, channels = ?now, "Subscriptions updated");
            }
            MessageType::GetStatus => {
                let status = bus.status().await?;
                reply(outbox, &BusMessage::Status { status }).await?;
            }
            MessageType::GetHistory { limit, channel } => {
                let events = bus.history(limit, channel).await?;
                reply(outbox, &BusMessage::History { events }).await?;
            }
            MessageType::Ping { seq } => {
                reply(outbox, &BusMessage::Pong { seq }).await?;
            }
            MessageType::Disconnect => {
                debug!(client_id, "Client requested disconnect");
                return Ok(false);
            }
            MessageType::Connect { .. } => {
                reply(
                    outbox,
                    &BusMessage::error_with_code("Already connected", "unexpected_message"),
                )
                .await?;
            }
        }
        Ok(true)
    }
}

/// Reads the next text frame, skipping control frames.
async fn next_text(stream: &mut WsStream) -> Result<String, ConnectionError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_MESSAGE_SIZE {
                    return Err(ConnectionError::MessageTooLarge {
                        size: text.len(),
                        max: MAX_MESSAGE_SIZE,
                    });
                }
                return Ok(text.as_str().to_string());
            }
            Some(Ok(Message::Close(_))) | None => return Err(ConnectionError::Eof),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ConnectionError::Io(e.to_string())),
        }
    }
}

/// Sends a message before the writer task exists.
async fn send_direct(sink: &mut WsSink, msg: &BusMessage) -> Result<(), ConnectionError> {
    let json = serde_json::to_string(msg).map_err(|e| ConnectionError::Parse(e.to_string()))?;
    match timeout(WRITE_TIMEOUT, sink.send(Message::Text(json.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Queues a direct reply behind any pending broadcast frames.
async fn reply(outbox: &Outbox, msg: &BusMessage) -> Result<(), ConnectionError> {
    let frame = encode(msg).ok_or_else(|| ConnectionError::Parse("unserializable reply".to_string()))?;
    match timeout(WRITE_TIMEOUT, outbox.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(ConnectionError::Eof),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Drains the client's queue into the socket.
async fn write_frames(mut sink: WsSink, mut queue: mpsc::Receiver<Frame>, kick: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            frame = queue.recv() => {
                let Some(frame) = frame else { break };
                let sent = timeout(WRITE_TIMEOUT, sink.send(Message::Text(frame.to_string().into()))).await;
                if !matches!(sent, Ok(Ok(()))) {
                    debug!("Write to client failed");
                    kick.cancel();
                    break;
                }
            }

            _ = kick.cancelled() => break,
        }
    }
    let _ = sink.close().await;
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Invalid or missing token")]
    Unauthorized,

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection timed out")]
    Timeout,

    #[error("Write timed out")]
    WriteTimeout,

    #[error("Connection closed")]
    Eof,

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));

        let err = ConnectionError::from(BusError::TooManyClients { max: 3 });
        assert!(err.to_string().contains("max: 3"));
    }
}
