//! WebSocket plumbing shared by the pool and the observer.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use hookbus_core::Envelope;
use hookbus_protocol::{BusMessage, ClientMessage, ProtocolVersion};

use crate::error::{ClientError, Result};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An accepted handshake.
#[derive(Debug, Clone)]
pub struct Session {
    pub client_id: String,
    /// History replayed on connect, oldest first
    pub replay: Vec<Envelope>,
}

pub async fn open(url: &str, connect_timeout: Duration) -> Result<WsStream> {
    match timeout(connect_timeout, connect_async(url)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(ClientError::Connect(e.to_string())),
        Err(_) => Err(ClientError::Timeout),
    }
}

pub async fn send(ws: &mut WsStream, msg: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    ws.send(Message::Text(json)).await?;
    Ok(())
}

/// Next bus message, skipping control frames.
pub async fn recv(ws: &mut WsStream) -> Result<BusMessage> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
            Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn recv_within(ws: &mut WsStream, wait: Duration) -> Result<BusMessage> {
    timeout(wait, recv(ws)).await.map_err(|_| ClientError::Timeout)?
}

/// Sends `hello` and consumes the welcome and the replay that follows it.
pub async fn handshake(ws: &mut WsStream, hello: &ClientMessage, wait: Duration) -> Result<Session> {
    send(ws, hello).await?;

    let client_id = match recv_within(ws, wait).await? {
        BusMessage::Welcome {
            protocol_version,
            client_id,
            ..
        } => {
            if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                return Err(ClientError::Rejected(format!(
                    "bus speaks protocol {protocol_version}, we speak {}",
                    ProtocolVersion::CURRENT
                )));
            }
            client_id
        }
        BusMessage::Rejected { reason, .. } => return Err(ClientError::Rejected(reason)),
        other => {
            return Err(ClientError::Protocol(format!(
                "unexpected response to connect: {other:?}"
            )))
        }
    };

    match recv_within(ws, wait).await? {
        BusMessage::History { events } => {
            debug!(client_id = %client_id, replayed = events.len(), "Handshake complete");
            Ok(Session {
                client_id,
                replay: events,
            })
        }
        other => Err(ClientError::Protocol(format!(
            "expected history replay, got {other:?}"
        ))),
    }
}

/// Delay sequence for reconnects: `initial`, then multiplied up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: initial,
        }
    }

    /// Returns the delay to wait now and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier.max(1.0)).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(300), 2.0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
