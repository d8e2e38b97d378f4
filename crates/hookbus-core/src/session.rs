//! Session records for in-flight agent sessions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DomainError;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for an agent or tool session.
///
/// Opaque string supplied by the producer (usually a UUID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Session Status
// ============================================================================

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Start event seen, no activity yet
    #[default]
    Starting,

    /// Activity seen since the start event
    Running,

    /// Session ended normally
    Completed,

    /// Session ended with an error
    Error,
}

impl SessionStatus {
    /// Returns the display label for this status.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Returns true once the session can no longer change status.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for SessionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(DomainError::InvalidFieldValue {
                field: "status".to_string(),
                value: other.to_string(),
                expected: "starting|running|completed|error".to_string(),
            }),
        }
    }
}

// ============================================================================
// Session Record
// ============================================================================

/// Tracks one in-flight agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,

    /// Agent name (`main`, `Engineer`, `Research`, ...)
    pub agent: String,

    pub status: SessionStatus,

    pub started_at: DateTime<Utc>,

    pub last_activity: DateTime<Utc>,

    /// Number of events attributed to this session
    pub event_count: u64,

    /// Most recent tool seen in a hook event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tool: Option<String>,
}

impl SessionRecord {
    /// Creates a record in the `starting` state.
    pub fn new(id: SessionId, agent: impl Into<String>) -> Self {
        Self::started_at(id, agent, Utc::now())
    }

    /// Creates a record with an explicit start time.
    pub fn started_at(id: SessionId, agent: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id,
            agent: agent.into(),
            status: SessionStatus::Starting,
            started_at: at,
            last_activity: at,
            event_count: 1,
            last_tool: None,
        }
    }

    /// Records activity; a starting session becomes running.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_activity = at;
        self.event_count = self.event_count.saturating_add(1);
        if self.status == SessionStatus::Starting {
            self.status = SessionStatus::Running;
        }
    }

    /// Moves the session to a terminal status.
    pub fn finish(&mut self, status: SessionStatus, at: DateTime<Utc>) {
        self.last_activity = at;
        self.event_count = self.event_count.saturating_add(1);
        self.status = status;
    }

    /// Returns true if the record should be garbage-collected.
    ///
    /// Any session idle for longer than `ttl` expires, finished or not.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_activity) > ttl
    }

    /// Returns the compact form carried in heartbeats.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            agent: self.agent.clone(),
            status: self.status,
        }
    }
}

/// Compact session view (id, agent, status).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub agent: String,
    pub status: SessionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_short() {
        let id = SessionId::new("8e11bfb5-7dc2-432b-9206-928fa5c35731");
        assert_eq!(id.short(), "8e11bfb5");
        assert_eq!(SessionId::new("abc").short(), "abc");
    }

    #[test]
    fn test_touch_promotes_starting_to_running() {
        let now = Utc::now();
        let mut record = SessionRecord::started_at(SessionId::new("s1"), "main", now);
        assert_eq!(record.status, SessionStatus::Starting);

        record.touch(now);
        assert_eq!(record.status, SessionStatus::Running);
        assert_eq!(record.event_count, 2);
    }

    #[test]
    fn test_touch_keeps_finished_status() {
        let now = Utc::now();
        let mut record = SessionRecord::started_at(SessionId::new("s1"), "main", now);
        record.finish(SessionStatus::Error, now);
        record.touch(now);
        assert_eq!(record.status, SessionStatus::Error);
    }

    #[test]
    fn test_expiry() {
        let start = Utc::now();
        let record = SessionRecord::started_at(SessionId::new("s1"), "main", start);
        let ttl = Duration::seconds(60);
        assert!(!record.is_expired(ttl, start + Duration::seconds(30)));
        assert!(record.is_expired(ttl, start + Duration::seconds(61)));
    }

    #[test]
    fn test_status_parse_and_serde() {
        assert_eq!("running".parse::<SessionStatus>().unwrap(), SessionStatus::Running);
        assert!("sleeping".parse::<SessionStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&SessionStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn test_summary() {
        let record = SessionRecord::new(SessionId::new("s1"), "Engineer");
        let summary = record.summary();
        assert_eq!(summary.id.as_str(), "s1");
        assert_eq!(summary.agent, "Engineer");
        assert_eq!(summary.status, SessionStatus::Starting);
    }
}
