//! hookbus client - producer pool and observer
//!
//! - `pool` - Non-blocking batched emitter for producers (hooks, agents)
//! - `observer` - Follows the bus: replay, live events, reconnect
//! - `ws` - WebSocket handshake and backoff shared by both

pub mod error;
pub mod observer;
pub mod pool;
pub mod ws;

pub use error::{ClientError, Result};
pub use observer::{fetch_history, Observer, ObserverConfig, ObserverEvent};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, DEFAULT_URL};
