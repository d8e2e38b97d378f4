//! Session tracking driven by hook and session events.
//!
//! The `HookProcessor` is the dedicated handler for envelopes the router
//! classifies as hook events. It only updates session state; storage and
//! broadcast stay with the actor so every event is recorded exactly once.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use hookbus_core::{Envelope, HookKind, SessionId, SessionRecord, SessionStatus, SessionSummary};

/// Agent name used when an event does not carry one.
pub const DEFAULT_AGENT: &str = "main";

// ============================================================================
// Session Table
// ============================================================================

/// In-memory session records keyed by session id.
#[derive(Debug, Default)]
pub struct SessionTable {
    records: HashMap<SessionId, SessionRecord>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&SessionRecord> {
        self.records.get(&SessionId::new(id))
    }

    /// Starts (or restarts) a session.
    pub fn start(&mut self, id: SessionId, agent: &str, at: DateTime<Utc>) {
        debug!(session_id = %id, agent, "Session started");
        self.records
            .insert(id.clone(), SessionRecord::started_at(id, agent, at));
    }

    /// Records activity, creating the record if the start event was missed.
    pub fn touch(&mut self, id: SessionId, agent: &str, at: DateTime<Utc>) -> &mut SessionRecord {
        self.records
            .entry(id)
            .and_modify(|r| r.touch(at))
            .or_insert_with_key(|id| {
                let mut record = SessionRecord::started_at(id.clone(), agent, at);
                record.status = SessionStatus::Running;
                record
            })
    }

    /// Moves a session to a terminal status.
    pub fn finish(&mut self, id: SessionId, agent: &str, status: SessionStatus, at: DateTime<Utc>) {
        match self.records.get_mut(&id) {
            Some(record) => record.finish(status, at),
            None => {
                let mut record = SessionRecord::started_at(id.clone(), agent, at);
                record.status = status;
                self.records.insert(id, record);
            }
        }
    }

    /// Drops every record idle for longer than `ttl`. Returns how many went.
    pub fn expire(&mut self, ttl: Duration, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_expired(ttl, now));
        before - self.records.len()
    }

    /// Compact views ordered by start time.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut records: Vec<&SessionRecord> = self.records.values().collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.as_str().cmp(b.id.as_str())));
        records.into_iter().map(SessionRecord::summary).collect()
    }
}

// ============================================================================
// Hook Processor
// ============================================================================

/// Applies hook and `session.*` events to the session table.
#[derive(Debug, Default, Clone, Copy)]
pub struct HookProcessor;

impl HookProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Updates sessions for an envelope routed as a hook event.
    pub fn process(&self, envelope: &Envelope, sessions: &mut SessionTable, now: DateTime<Utc>) {
        let Some(id) = envelope.session_id().map(SessionId::new) else {
            return;
        };
        let agent = agent_name(envelope);

        match HookKind::from_subtype(&envelope.subtype) {
            Some(HookKind::SessionStart) => sessions.start(id, agent, now),
            Some(HookKind::SessionEnd) => {
                sessions.finish(id, agent, SessionStatus::Completed, now);
            }
            Some(HookKind::Error) => sessions.finish(id, agent, SessionStatus::Error, now),
            Some(HookKind::PreTool) => {
                let tool = envelope.field_str("tool_name").map(str::to_string);
                let record = sessions.touch(id, agent, now);
                if tool.is_some() {
                    record.last_tool = tool;
                }
            }
            Some(_) | None => {
                sessions.touch(id, agent, now);
            }
        }
    }

    /// Updates sessions for a generic `session.*` envelope.
    pub fn process_session_event(
        &self,
        envelope: &Envelope,
        sessions: &mut SessionTable,
        now: DateTime<Utc>,
    ) {
        let Some(id) = envelope.session_id().map(SessionId::new) else {
            return;
        };
        let agent = agent_name(envelope);

        match envelope.subtype.as_str() {
            "start" | "started" | "created" => sessions.start(id, agent, now),
            "end" | "ended" | "completed" | "stopped" => {
                sessions.finish(id, agent, SessionStatus::Completed, now);
            }
            "error" | "failed" => sessions.finish(id, agent, SessionStatus::Error, now),
            "status" | "updated" => match envelope.field_str("status").map(str::parse::<SessionStatus>) {
                Some(Ok(status)) if status.is_finished() => sessions.finish(id, agent, status, now),
                Some(Ok(status)) => sessions.touch(id, agent, now).status = status,
                Some(Err(e)) => {
                    debug!(error = %e, "Ignoring session status");
                    sessions.touch(id, agent, now);
                }
                None => {
                    sessions.touch(id, agent, now);
                }
            },
            _ => {
                sessions.touch(id, agent, now);
            }
        }
    }
}

fn agent_name(envelope: &Envelope) -> &str {
    envelope
        .field_str("agent")
        .or_else(|| envelope.field_str("agent_type"))
        .or_else(|| envelope.field_str("subagent_type"))
        .filter(|a| !a.is_empty())
        .unwrap_or(DEFAULT_AGENT)
}
