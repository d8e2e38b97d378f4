//! Error types for bus clients.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` in this crate.

use std::io;
use thiserror::Error;

/// Errors raised while talking to the bus.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The TCP or WebSocket connection could not be opened.
    #[error("Failed to connect to bus: {0}. Is hookbusd running?")]
    Connect(String),

    /// The bus did not answer in time.
    #[error("Timed out waiting for the bus")]
    Timeout,

    /// The bus refused the handshake (version, token, client limit).
    #[error("Bus rejected connection: {0}")]
    Rejected(String),

    /// The bus sent something we did not expect.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The connection closed.
    #[error("Connection closed")]
    Closed,

    /// The pool's background thread could not be started.
    #[error("Failed to start pool worker: {0}")]
    Spawn(#[from] io::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl ClientError {
    /// Returns true if retrying the same request might succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_) | Self::Spawn(_) | Self::Cancelled)
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
