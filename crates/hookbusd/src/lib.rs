//! hookbus daemon - event bus, replay and lifecycle
//!
//! This crate provides the server side of hookbus:
//! - `bus` - Dispatcher actor owning history, clients and sessions
//! - `server` - WebSocket and `/health` front end
//! - `heartbeat` - Periodic `system.heartbeat` events
//! - `ports` - Port scanning, occupant classification and reclaim
//! - `daemon` - start/stop/restart/status/list of the background server
//! - `instances` - Registry of running servers
//! - `runtime` - One server process from bind to clean exit
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        hookbusd                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ EventBusServer  │────▶│         BusActor            │   │
//! │  │ (/ws, /health)  │     │ (history, sessions, counts) │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ connections                 │ frames            │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│◀────│   per-client outbox (mpsc)  │   │
//! │  │  (per client)   │     │                             │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! │  Heartbeat ──▶ BusActor      DaemonManager ──▶ files/probes │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod bus;
pub mod config;
pub mod daemon;
pub mod heartbeat;
pub mod instances;
pub mod metrics;
pub mod ports;
pub mod runtime;
pub mod server;
