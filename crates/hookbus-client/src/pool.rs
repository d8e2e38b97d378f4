//! Sender-side connection pool.
//!
//! Producers call [`ConnectionPool::emit`] from any thread, sync or async.
//! The call only pushes onto a bounded queue and never blocks. A worker on
//! its own OS thread (with its own current-thread runtime) drains the
//! queue into `emit_batch` frames over one long-lived connection.
//!
//! ```text
//!   emit() ──try_send──▶ [bounded queue] ──▶ worker thread
//!                                               │ batch (size or interval)
//!                                               ▼
//!                                        emit_batch ──▶ bus ──▶ ack
//! ```
//!
//! Failures never reach the caller: a full queue drops the event, and a
//! batch that still fails after `max_retries` reconnects is dropped. Both
//! are logged and counted in [`PoolStats`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hookbus_core::now_timestamp;
use hookbus_protocol::{BusMessage, ChannelEvent, ClientMessage};

use crate::error::{ClientError, Result};
use crate::ws::{self, Backoff, WsStream};

/// Default bus endpoint.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:8765/ws";

/// Floor for `flush_interval` and `connect_timeout`.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// WebSocket endpoint of the bus.
    pub url: String,

    /// Events held while the worker is busy or the bus is away.
    pub queue_capacity: usize,

    /// Flush as soon as this many events are pending.
    pub batch_size: usize,

    /// Flush whatever is pending at least this often.
    pub flush_interval: Duration,

    /// Reconnect attempts per batch before it is dropped.
    pub max_retries: u32,

    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,

    /// Budget for opening the connection, and for each ack.
    pub connect_timeout: Duration,

    pub client_id: Option<String>,
    pub token: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            queue_capacity: 1000,
            batch_size: 50,
            flush_interval: Duration::from_millis(100),
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            connect_timeout: Duration::from_secs(1),
            client_id: None,
            token: None,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    sent: AtomicU64,
    dropped_full: AtomicU64,
    dropped_failed: AtomicU64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Accepted onto the queue
    pub queued: u64,
    /// Acknowledged by the bus
    pub sent: u64,
    /// Rejected because the queue was full
    pub dropped_full: u64,
    /// Lost with a batch that exhausted its retries
    pub dropped_failed: u64,
}

// ============================================================================
// Connection Pool
// ============================================================================

/// Non-blocking batched emitter.
///
/// Dropping the pool stops the worker without waiting for it; call
/// [`ConnectionPool::shutdown`] to flush what is still queued.
pub struct ConnectionPool {
    queue: mpsc::Sender<ChannelEvent>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    worker: Option<thread::JoinHandle<()>>,
}

impl ConnectionPool {
    /// Starts the worker thread. Zero intervals are raised to 1ms.
    pub fn new(mut config: PoolConfig) -> Result<Self> {
        config.flush_interval = config.flush_interval.max(MIN_INTERVAL);
        config.connect_timeout = config.connect_timeout.max(MIN_INTERVAL);

        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();

        let worker = Worker {
            config,
            rx,
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
            conn: None,
        };

        let handle = thread::Builder::new()
            .name("hookbus-pool".to_string())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(worker.run()),
                    Err(e) => warn!(error = %e, "Pool worker could not start a runtime"),
                }
            })?;

        Ok(Self {
            queue,
            counters,
            cancel,
            worker: Some(handle),
        })
    }

    /// Queues `{type, timestamp, data}` for `channel`.
    ///
    /// An empty channel lets the bus derive one from the type. Returns
    /// false if the event was dropped.
    pub fn emit(&self, channel: &str, event_type: &str, payload: Value) -> bool {
        let event = json!({
            "type": event_type,
            "timestamp": now_timestamp(),
            "data": payload,
        });
        let channel = (!channel.is_empty()).then(|| channel.to_string());
        self.emit_raw(channel, event)
    }

    /// Queues an already-shaped event.
    pub fn emit_raw(&self, channel: Option<String>, event: Value) -> bool {
        match self.queue.try_send(ChannelEvent { channel, event }) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                let dropped = self.counters.dropped_full.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    warn!(dropped, "Pool queue full, dropping events");
                }
                false
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped_full: self.counters.dropped_full.load(Ordering::Relaxed),
            dropped_failed: self.counters.dropped_failed.load(Ordering::Relaxed),
        }
    }

    /// Flushes the queue (one attempt per batch) and joins the worker.
    pub fn shutdown(mut self) -> PoolStats {
        self.cancel.cancel();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Pool worker panicked");
            }
        }
        self.stats()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    config: PoolConfig,
    rx: mpsc::Receiver<ChannelEvent>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    conn: Option<WsStream>,
}

impl Worker {
    async fn run(mut self) {
        debug!(url = %self.config.url, "Pool worker started");

        let batch_size = self.config.batch_size.max(1);
        let mut pending: Vec<ChannelEvent> = Vec::with_capacity(batch_size);
        let mut ticker = interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                item = self.rx.recv() => match item {
                    Some(event) => {
                        pending.push(event);
                        if pending.len() >= batch_size {
                            self.flush(&mut pending).await;
                        }
                    }
                    None => break,
                },

                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        self.flush(&mut pending).await;
                    }
                }
            }
        }

        // Final drain: whatever is queued gets one attempt per batch.
        while let Ok(event) = self.rx.try_recv() {
            pending.push(event);
            if pending.len() >= batch_size {
                self.flush(&mut pending).await;
            }
        }
        if !pending.is_empty() {
            self.flush(&mut pending).await;
        }

        if let Some(mut conn) = self.conn.take() {
            let _ = ws::send(&mut conn, &ClientMessage::disconnect()).await;
            let _ = conn.close(None).await;
        }
        debug!("Pool worker stopped");
    }

    /// Sends `pending` as one batch, reconnecting with backoff. The batch
    /// is dropped after `max_retries` failed retries.
    async fn flush(&mut self, pending: &mut Vec<ChannelEvent>) {
        let batch = std::mem::take(pending);
        let mut backoff = Backoff::new(
            self.config.initial_backoff,
            self.config.max_backoff,
            self.config.backoff_multiplier,
        );

        for attempt in 0..=self.config.max_retries {
            match self.try_send(&batch).await {
                Ok(accepted) => {
                    self.counters.sent.fetch_add(accepted as u64, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Batch send failed");
                    self.conn = None;
                    if !e.is_transient() {
                        break;
                    }
                }
            }

            if attempt == self.config.max_retries || self.cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = sleep(backoff.next_delay()) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        self.counters
            .dropped_failed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        warn!(events = batch.len(), "Dropping batch, bus unreachable");
    }

    async fn try_send(&mut self, batch: &[ChannelEvent]) -> Result<usize> {
        let wait = self.config.connect_timeout;

        if self.conn.is_none() {
            let mut conn = ws::open(&self.config.url, wait).await?;
            let hello = ClientMessage::connect_producer(self.config.client_id.clone(), self.config.token.clone());
            let session = ws::handshake(&mut conn, &hello, wait).await?;
            info!(client_id = %session.client_id, "Pool connected to bus");
            self.conn = Some(conn);
        }
        let conn = self.conn.as_mut().ok_or(ClientError::Closed)?;

        ws::send(conn, &ClientMessage::emit_batch(batch.to_vec())).await?;

        loop {
            let reply = timeout(wait, ws::recv(conn))
                .await
                .map_err(|_| ClientError::Timeout)??;
            match reply {
                BusMessage::Ack { accepted } => return Ok(accepted),
                BusMessage::Error { message, .. } => return Err(ClientError::Protocol(message)),
                _ => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn unreachable_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("ws://127.0.0.1:{port}/ws")
    }

    #[test]
    fn test_emit_never_blocks_without_bus() {
        let pool = ConnectionPool::new(PoolConfig {
            url: unreachable_url(),
            ..PoolConfig::default()
        })
        .unwrap();

        let started = Instant::now();
        for n in 0..1000 {
            pool.emit("/hook", "hook.pre_tool", json!({"n": n}));
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        let stats = pool.stats();
        assert_eq!(stats.queued + stats.dropped_full, 1000);
        pool.shutdown();
    }

    #[test]
    fn test_full_queue_drops() {
        let pool = ConnectionPool::new(PoolConfig {
            url: unreachable_url(),
            queue_capacity: 1,
            batch_size: 1,
            initial_backoff: Duration::from_secs(1),
            ..PoolConfig::default()
        })
        .unwrap();

        let accepted = (0..50)
            .filter(|_| pool.emit("", "agent.step", json!({})))
            .count();
        assert!(accepted < 50);
        assert!(pool.stats().dropped_full > 0);
    }

    #[test]
    fn test_zero_intervals_keep_worker_alive() {
        let pool = ConnectionPool::new(PoolConfig {
            url: unreachable_url(),
            flush_interval: Duration::ZERO,
            connect_timeout: Duration::ZERO,
            max_retries: 0,
            ..PoolConfig::default()
        })
        .unwrap();

        for n in 0..10 {
            assert!(pool.emit("", "agent.step", json!({"n": n})));
        }
        std::thread::sleep(Duration::from_millis(500));

        let stats = pool.shutdown();
        assert_eq!(stats.queued, 10);
        assert_eq!(stats.dropped_full, 0);
        assert_eq!(stats.dropped_failed, 10);
    }

    #[test]
    fn test_failed_batch_is_dropped_and_counted() {
        let pool = ConnectionPool::new(PoolConfig {
            url: unreachable_url(),
            flush_interval: Duration::from_millis(10),
            max_retries: 1,
            initial_backoff: Duration::from_millis(10),
            ..PoolConfig::default()
        })
        .unwrap();

        pool.emit("", "agent.step", json!({}));
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(pool.stats().dropped_failed, 1);
        pool.shutdown();
    }
}
