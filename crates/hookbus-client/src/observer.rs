//! Observer client: replay plus live events, with reconnect.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` in this module.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hookbus_core::Envelope;
use hookbus_protocol::{BusMessage, ClientMessage};

use crate::error::{ClientError, Result};
use crate::pool::DEFAULT_URL;
use crate::ws::{self, Backoff, WsStream};

// ============================================================================
// Configuration
// ============================================================================

/// Connection behaviour for an [`Observer`].
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub url: String,

    /// Channels to follow; every channel when `None`.
    pub channels: Option<Vec<String>>,

    pub client_id: Option<String>,
    pub token: Option<String>,

    pub connect_timeout: Duration,

    /// Initial delay before the first retry after a failure.
    pub retry_initial_delay: Duration,

    /// Maximum delay between retry attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff.
    pub retry_multiplier: f64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            channels: None,
            client_id: None,
            token: None,
            connect_timeout: Duration::from_secs(2),
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
        }
    }
}

/// What the observer reports to its consumer.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    Connected { client_id: String },
    /// Replayed history, oldest first; sent after every (re)connect
    History(Vec<Envelope>),
    Event { channel: String, event: Envelope },
    Disconnected,
}

// ============================================================================
// Observer
// ============================================================================

/// Follows the bus until cancelled, reconnecting with exponential backoff.
pub struct Observer {
    config: ObserverConfig,
    event_tx: mpsc::UnboundedSender<ObserverEvent>,
    cancel_token: CancellationToken,
}

impl Observer {
    #[must_use]
    pub fn new(
        config: ObserverConfig,
        event_tx: mpsc::UnboundedSender<ObserverEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            event_tx,
            cancel_token,
        }
    }

    /// Runs until the token is cancelled, the consumer goes away, or the
    /// bus rejects us.
    pub async fn run(&self) -> Result<()> {
        info!(url = %self.config.url, "Observer starting");
        let mut backoff = Backoff::new(
            self.config.retry_initial_delay,
            self.config.retry_max_delay,
            self.config.retry_multiplier,
        );

        loop {
            if self.cancel_token.is_cancelled() {
                return Ok(());
            }

            match self.follow(&mut backoff).await {
                Ok(()) => {}
                Err(ClientError::Cancelled) => return Ok(()),
                Err(e) if !e.is_transient() => {
                    warn!(error = %e, "Observer giving up");
                    return Err(e);
                }
                Err(e) => debug!(error = %e, "Observer connection lost"),
            }

            if self.event_tx.is_closed() {
                return Ok(());
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.cancel_token.cancelled() => return Ok(()),
            }
        }
    }

    /// One connection's lifetime.
    async fn follow(&self, backoff: &mut Backoff) -> Result<()> {
        let mut conn = tokio::select! {
            result = ws::open(&self.config.url, self.config.connect_timeout) => result?,
            _ = self.cancel_token.cancelled() => return Err(ClientError::Cancelled),
        };

        let hello = ClientMessage::new(hookbus_protocol::MessageType::Connect {
            client_id: self.config.client_id.clone(),
            channels: self.config.channels.clone(),
            token: self.config.token.clone(),
        });
        let session = ws::handshake(&mut conn, &hello, self.config.connect_timeout).await?;
        backoff.reset();

        self.forward(ObserverEvent::Connected {
            client_id: session.client_id,
        })?;
        self.forward(ObserverEvent::History(session.replay))?;

        let result = self.read_events(&mut conn).await;
        let _ = self.event_tx.send(ObserverEvent::Disconnected);
        result
    }

    async fn read_events(&self, conn: &mut WsStream) -> Result<()> {
        loop {
            let msg = tokio::select! {
                msg = ws::recv(conn) => msg?,
                _ = self.cancel_token.cancelled() => {
                    let _ = ws::send(conn, &ClientMessage::disconnect()).await;
                    return Err(ClientError::Cancelled);
                }
            };

            match msg {
                BusMessage::Event { channel, event } => {
                    self.forward(ObserverEvent::Event { channel, event })?;
                }
                BusMessage::Error { message, .. } => warn!(%message, "Bus reported an error"),
                other => debug!(message = ?other, "Ignoring bus message"),
            }
        }
    }

    fn forward(&self, event: ObserverEvent) -> Result<()> {
        self.event_tx.send(event).map_err(|_| ClientError::Cancelled)
    }
}

/// Connects once as a producer-only client and requests history.
pub async fn fetch_history(
    url: &str,
    token: Option<String>,
    limit: Option<usize>,
    channel: Option<String>,
    wait: Duration,
) -> Result<Vec<Envelope>> {
    let mut conn = ws::open(url, wait).await?;
    ws::handshake(&mut conn, &ClientMessage::connect_producer(None, token), wait).await?;
    ws::send(&mut conn, &ClientMessage::get_history(limit, channel)).await?;

    loop {
        let msg = tokio::time::timeout(wait, ws::recv(&mut conn))
            .await
            .map_err(|_| ClientError::Timeout)??;
        if let BusMessage::History { events } = msg {
            let _ = ws::send(&mut conn, &ClientMessage::disconnect()).await;
            return Ok(events);
        }
    }
}
