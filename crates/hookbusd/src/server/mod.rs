//! WebSocket and health server for the bus.
//!
//! The server:
//! - Binds one TCP port and serves it with axum
//! - Upgrades `GET /ws` to a WebSocket and spawns a ConnectionHandler
//! - Answers `GET /health` with a JSON health report
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ EventBusServer  │  GET /health ──▶ HealthReport
//! │  TcpListener    │
//! └───────┬─────────┘
//!         │ GET /ws (upgrade)
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│    BusHandle    │
//! │   (per client)  │◀────│  (outbox frames)│
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, MAX_MESSAGE_SIZE, OUTBOX_CAPACITY};

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hookbus_protocol::health::HEALTHY;
use hookbus_protocol::HealthReport;

use crate::bus::BusHandle;

/// Default bind host. The bus is a local service.
pub const DEFAULT_HOST: [u8; 4] = [127, 0, 0, 1];

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub bus: BusHandle,
    /// Parent of every per-connection token
    pub cancel: CancellationToken,
    pub auth_token: Option<Arc<str>>,
    pub port: u16,
    connection_counter: Arc<AtomicU64>,
}

/// Builds the HTTP router (`/ws`, `/health`).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let connection_number = state.connection_counter.fetch_add(1, Ordering::Relaxed);
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| ConnectionHandler::new(state, connection_number).run(socket))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.bus.status().await {
        Ok(status) => {
            let report = HealthReport {
                status: HEALTHY.to_string(),
                connections: status.connections,
                events_received: status.events_received,
                uptime_seconds: status.uptime_seconds,
                server_id: status.server_id,
                version: env!("CARGO_PKG_VERSION").to_string(),
                pid: std::process::id(),
                port: state.port,
            };
            (StatusCode::OK, Json(report)).into_response()
        }
        Err(e) => {
            debug!(error = %e, "Health check while bus is down");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

/// The bus's network front end.
pub struct EventBusServer {
    listener: TcpListener,
    state: AppState,
}

impl EventBusServer {
    /// Binds `addr`. Port 0 picks an ephemeral port (see [`Self::local_addr`]).
    pub async fn bind(
        addr: SocketAddr,
        bus: BusHandle,
        auth_token: Option<String>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?
            .port();

        Ok(Self {
            listener,
            state: AppState {
                bus,
                cancel: cancel_token,
                auth_token: auth_token.map(Arc::from),
                port,
                connection_counter: Arc::new(AtomicU64::new(0)),
            },
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::Serve)
    }

    /// Serves until the cancellation token fires, then closes every client.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.local_addr()?;
        info!(%addr, "Bus server listening");

        let cancel = self.state.cancel.clone();
        let bus = self.state.bus.clone();
        let app = router(self.state);

        let result = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await;

        bus.shutdown().await;

        match result {
            Ok(()) => {
                info!("Bus server stopped");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Bus server failed");
                Err(ServerError::Serve(e))
            }
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[source] io::Error),
}

impl ServerError {
    /// Returns true if binding failed because the port is taken.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, Self::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{spawn_bus, BusSettings};

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let bus = spawn_bus(BusSettings::default());
        let server = EventBusServer::bind(
            SocketAddr::from((DEFAULT_HOST, 0)),
            bus,
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_addr_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let bus = spawn_bus(BusSettings::default());
        let err = EventBusServer::bind(addr, bus, None, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(err.is_addr_in_use());
    }
}
