//! The normalized event envelope.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Channel name that matches every event.
pub const WILDCARD_CHANNEL: &str = "*";

/// A normalized event record.
///
/// The canonical fields (`type`, `subtype`, `timestamp`, `id`,
/// `originalEventName`) are set once by the router. `data` keeps the payload
/// exactly as received, while `fields` holds the payload keys copied up to
/// the top level of the serialized object.
///
/// Serialized shape:
///
/// ```json
/// {
///   "type": "hook",
///   "subtype": "pre_tool",
///   "timestamp": "2026-01-01T00:00:00Z",
///   "originalEventName": "hook.pre_tool",
///   "tool_name": "Bash",
///   "data": { "tool_name": "Bash" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Canonical top-level category (`hook`, `session`, `system`, ...)
    #[serde(rename = "type")]
    pub event_type: String,

    /// Canonical sub-category, empty when the event has none
    #[serde(default)]
    pub subtype: String,

    /// ISO-8601 timestamp assigned at the origin
    pub timestamp: String,

    /// Opaque correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Event name exactly as the producer sent it
    #[serde(rename = "originalEventName", default)]
    pub original_event_name: String,

    /// Payload as received
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    /// Payload keys flattened to the top level
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Creates an envelope stamped with the current time.
    ///
    /// Used for events the bus originates itself (heartbeats).
    pub fn new(event_type: impl Into<String>, subtype: impl Into<String>) -> Self {
        let event_type = event_type.into();
        let subtype = subtype.into();
        let original_event_name = if subtype.is_empty() {
            event_type.clone()
        } else {
            format!("{event_type}.{subtype}")
        };

        Self {
            event_type,
            subtype,
            timestamp: now_timestamp(),
            id: None,
            original_event_name,
            data: Value::Null,
            fields: Map::new(),
        }
    }

    /// Sets the payload, flattening its keys into `fields`.
    ///
    /// Only meant for bus-originated events whose payload keys are known
    /// not to collide with canonical fields.
    #[must_use]
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        for (key, value) in &data {
            self.fields.insert(key.clone(), value.clone());
        }
        self.data = Value::Object(data);
        self
    }

    /// Returns the broadcast channel this envelope belongs to (`/hook`, `/system`, ...).
    pub fn channel(&self) -> String {
        format!("/{}", self.event_type)
    }

    /// Returns `type.subtype`, or just `type` when there is no subtype.
    pub fn qualified_name(&self) -> String {
        if self.subtype.is_empty() {
            self.event_type.clone()
        } else {
            format!("{}.{}", self.event_type, self.subtype)
        }
    }

    /// Looks up a payload field, preferring the flattened copy.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).or_else(|| self.data.get(key))
    }

    /// Looks up a payload field as a string.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }

    /// Returns the session id carried by this event, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.field_str("session_id")
            .or_else(|| self.field_str("sessionId"))
            .filter(|s| !s.is_empty())
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

/// Current time as an RFC 3339 string.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// Returns true if a subscription to `subscribed` receives events on `channel`.
pub fn channel_matches(subscribed: &str, channel: &str) -> bool {
    subscribed == WILDCARD_CHANNEL || subscribed == channel
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_sets_original_name() {
        let env = Envelope::new("system", "heartbeat");
        assert_eq!(env.original_event_name, "system.heartbeat");
        assert_eq!(env.channel(), "/system");
        assert!(chrono::DateTime::parse_from_rfc3339(&env.timestamp).is_ok());
    }

    #[test]
    fn test_serialized_shape_is_flat() {
        let mut data = Map::new();
        data.insert("clients".to_string(), json!(3));
        let env = Envelope::new("system", "heartbeat").with_data(data);

        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "system");
        assert_eq!(value["subtype"], "heartbeat");
        assert_eq!(value["clients"], 3);
        assert_eq!(value["data"]["clients"], 3);
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_deserialize_collects_extra_fields() {
        let env: Envelope = serde_json::from_value(json!({
            "type": "hook",
            "subtype": "pre_tool",
            "timestamp": "2026-01-01T00:00:00Z",
            "originalEventName": "hook.pre_tool",
            "session_id": "abc",
            "data": {"session_id": "abc"}
        }))
        .unwrap();

        assert_eq!(env.session_id(), Some("abc"));
        assert_eq!(env.qualified_name(), "hook.pre_tool");
        assert!(env.fields.get("type").is_none());
    }

    #[test]
    fn test_channel_matches() {
        assert!(channel_matches("*", "/hook"));
        assert!(channel_matches("/hook", "/hook"));
        assert!(!channel_matches("/system", "/hook"));
    }
}
