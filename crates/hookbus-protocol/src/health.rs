//! Health report served at `GET /health`.

use serde::{Deserialize, Serialize};

/// Status string of a healthy bus.
pub const HEALTHY: &str = "healthy";

/// Body of the health endpoint.
///
/// The daemon manager compares `server_id` against the id it recorded at
/// launch to detect a different server answering on the same port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub connections: usize,
    pub events_received: u64,
    pub uptime_seconds: u64,
    pub server_id: String,

    /// Crate version of the serving daemon
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub pid: u32,

    #[serde(default)]
    pub port: u16,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HEALTHY
    }
}
