//! Classification and normalization of raw inbound events.
//!
//! Producers send events in several shapes: current `{"type": "hook.pre_tool"}`
//! names, dotted `{"type": "session.started"}` names, plain `{"type": "status"}`
//! names, and legacy `{"event": "SubagentStart"}` names. The router applies an
//! ordered rule list; the first rule that matches decides `type`/`subtype`.
//!
//! | Order | Rule          | Matches                                 | Result                        |
//! |-------|---------------|-----------------------------------------|-------------------------------|
//! | 1     | `Legacy`      | no `type` key, string `event` key       | legacy table lookup           |
//! | 2     | `HookPrefix`  | `type` starts with `hook.`              | `hook` / remainder            |
//! | 3     | `DottedSplit` | `type` contains `.`                     | split on the first `.`        |
//! | 4     | `Plain`       | anything else                           | `type` (or `unknown`) / `""`  |
//!
//! Rule 2 is a prefix test: a bare `"hook"` type falls through to rule 4 and
//! is routed as a generic event.
//!
//! Normalization never fails. Malformed input degrades to `type = "unknown"`.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::envelope::{now_timestamp, Envelope};

/// Payload keys that may never overwrite the envelope's canonical fields.
pub const PROTECTED_KEYS: [&str; 7] = [
    "type",
    "subtype",
    "timestamp",
    "id",
    "event",
    "event_type",
    "originalEventName",
];

/// Key holding the nested payload copy; flattening skips it as well.
const DATA_KEY: &str = "data";

/// Prefix identifying hook sub-events.
const HOOK_PREFIX: &str = "hook.";

/// Type used when an event cannot be classified.
const UNKNOWN_TYPE: &str = "unknown";

// ============================================================================
// Legacy Names
// ============================================================================

/// Legacy event names sent by older producers in the `event` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyEvent {
    SubagentStart,
    SubagentStop,
    UserPrompt,
    ToolCall,
    /// Any other legacy name; maps to `system.<lowercased name>`
    Other(String),
}

impl LegacyEvent {
    /// Looks up a legacy event name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "SubagentStart" => Self::SubagentStart,
            "SubagentStop" => Self::SubagentStop,
            "UserPrompt" => Self::UserPrompt,
            "ToolCall" => Self::ToolCall,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns the canonical dotted name (`subagent.start`, `hook.user_prompt`, ...).
    pub fn canonical_name(&self) -> String {
        match self {
            Self::SubagentStart => "subagent.start".to_string(),
            Self::SubagentStop => "subagent.stop".to_string(),
            Self::UserPrompt => "hook.user_prompt".to_string(),
            Self::ToolCall => "tool.call".to_string(),
            Self::Other(name) => format!("system.{}", name.to_lowercase()),
        }
    }
}

// ============================================================================
// Rules
// ============================================================================

/// How an event should be processed after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// A `hook.*` sub-event, handled by the dedicated hook handler
    Hook,
    /// Everything else, stored and broadcast directly
    Generic,
}

/// Result of classifying an event's name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Classification {
    event_type: String,
    subtype: String,
    original_event_name: String,
    route: Route,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Legacy,
    HookPrefix,
    DottedSplit,
    Plain,
}

/// Rules in evaluation order; `Plain` always matches.
const RULES: [Rule; 4] = [Rule::Legacy, Rule::HookPrefix, Rule::DottedSplit, Rule::Plain];

impl Rule {
    fn apply(self, raw: &Map<String, Value>) -> Option<Classification> {
        match self {
            Self::Legacy => {
                if raw.contains_key("type") {
                    return None;
                }
                let name = raw.get("event")?.as_str()?;
                let canonical = LegacyEvent::from_name(name).canonical_name();
                let mut classification = classify_name(&canonical)?;
                classification.original_event_name = name.to_string();
                Some(classification)
            }
            Self::HookPrefix => {
                let name = raw.get("type")?.as_str()?;
                let subtype = name.strip_prefix(HOOK_PREFIX)?;
                Some(Classification {
                    event_type: "hook".to_string(),
                    subtype: subtype.to_string(),
                    original_event_name: name.to_string(),
                    route: Route::Hook,
                })
            }
            Self::DottedSplit => {
                let name = raw.get("type")?.as_str()?;
                let (event_type, subtype) = name.split_once('.')?;
                Some(Classification {
                    event_type: non_empty_or_unknown(event_type),
                    subtype: subtype.to_string(),
                    original_event_name: name.to_string(),
                    route: Route::Generic,
                })
            }
            Self::Plain => {
                let name = raw.get("type").and_then(Value::as_str).unwrap_or_default();
                let subtype = raw
                    .get("subtype")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Some(Classification {
                    event_type: non_empty_or_unknown(name),
                    subtype: subtype.to_string(),
                    original_event_name: non_empty_or_unknown(name),
                    route: Route::Generic,
                })
            }
        }
    }
}

/// Classifies a canonical dotted name using the prefix and split rules.
fn classify_name(name: &str) -> Option<Classification> {
    let mut raw = Map::new();
    raw.insert("type".to_string(), Value::String(name.to_string()));
    [Rule::HookPrefix, Rule::DottedSplit]
        .into_iter()
        .find_map(|rule| rule.apply(&raw))
}

fn non_empty_or_unknown(s: &str) -> String {
    if s.is_empty() {
        UNKNOWN_TYPE.to_string()
    } else {
        s.to_string()
    }
}

// ============================================================================
// Normalization
// ============================================================================

/// A normalized event plus routing information.
#[derive(Debug, Clone)]
pub struct Normalized {
    /// The canonical envelope
    pub envelope: Envelope,

    /// Whether the dedicated hook handler should process it
    pub route: Route,

    /// Protected payload keys that were dropped during flattening
    pub skipped: Vec<String>,
}

/// Normalizes a raw event into an envelope.
///
/// See the module docs for the classification rules.
pub fn normalize(raw: &Value) -> Envelope {
    route(raw).envelope
}

/// Normalizes a raw event and reports how it should be routed.
pub fn route(raw: &Value) -> Normalized {
    let empty = Map::new();
    let map = match raw.as_object() {
        Some(map) => map,
        None => {
            debug!(raw = %raw, "Event is not a JSON object, classifying as unknown");
            &empty
        }
    };

    let classification = RULES
        .into_iter()
        .find_map(|rule| rule.apply(map))
        .unwrap_or_else(|| Classification {
            event_type: UNKNOWN_TYPE.to_string(),
            subtype: String::new(),
            original_event_name: UNKNOWN_TYPE.to_string(),
            route: Route::Generic,
        });

    let timestamp = map
        .get("timestamp")
        .and_then(Value::as_str)
        .filter(|ts| !ts.is_empty())
        .map(str::to_string)
        .unwrap_or_else(now_timestamp);

    let id = map.get("id").and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    let mut envelope = Envelope {
        event_type: classification.event_type,
        subtype: classification.subtype,
        timestamp,
        id,
        original_event_name: classification.original_event_name,
        data: Value::Null,
        fields: Map::new(),
    };

    // Producer-supplied top-level extras (session_id, source, ...) are kept as-is.
    for (key, value) in map {
        if is_reserved(key) || key == "subtype" {
            continue;
        }
        envelope.fields.insert(key.clone(), value.clone());
    }

    let mut skipped = Vec::new();
    match map.get(DATA_KEY) {
        Some(Value::Object(data)) => {
            for (key, value) in data {
                if is_reserved(key) {
                    warn!(
                        key = %key,
                        event = %envelope.qualified_name(),
                        "Ignoring protected field in event data"
                    );
                    skipped.push(key.clone());
                    continue;
                }
                if envelope.fields.contains_key(key) {
                    debug!(key = %key, "Top-level field already set, keeping producer value");
                    continue;
                }
                envelope.fields.insert(key.clone(), value.clone());
            }
            envelope.data = Value::Object(data.clone());
        }
        Some(other) => {
            debug!(event = %envelope.qualified_name(), "Event data is not an object, not flattening");
            envelope.data = other.clone();
        }
        None => {}
    }

    Normalized {
        envelope,
        route: classification.route,
        skipped,
    }
}

fn is_reserved(key: &str) -> bool {
    key == DATA_KEY || PROTECTED_KEYS.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hook_prefix_routes_to_hook() {
        let n = route(&json!({"type": "hook.pre_tool", "data": {"tool_name": "Bash"}}));
        assert_eq!(n.route, Route::Hook);
        assert_eq!(n.envelope.event_type, "hook");
        assert_eq!(n.envelope.subtype, "pre_tool");
        assert_eq!(n.envelope.original_event_name, "hook.pre_tool");
        assert_eq!(n.envelope.field_str("tool_name"), Some("Bash"));
    }

    #[test]
    fn test_bare_hook_type_is_generic() {
        let n = route(&json!({"type": "hook"}));
        assert_eq!(n.route, Route::Generic);
        assert_eq!(n.envelope.event_type, "hook");
        assert_eq!(n.envelope.subtype, "");
    }

    #[test]
    fn test_hook_prefix_with_dotted_remainder() {
        let n = route(&json!({"type": "hook.tool.pre"}));
        assert_eq!(n.route, Route::Hook);
        assert_eq!(n.envelope.subtype, "tool.pre");
    }

    #[test]
    fn test_legacy_subagent_start() {
        let env = normalize(&json!({"event": "SubagentStart", "data": {"agent_type": "Engineer"}}));
        assert_eq!(env.event_type, "subagent");
        assert_eq!(env.subtype, "start");
        assert_eq!(env.original_event_name, "SubagentStart");
        assert_eq!(env.field_str("agent_type"), Some("Engineer"));

        let value = serde_json::to_value(&env).unwrap();
        assert!(value.get("event").is_none());
        assert_eq!(value["agent_type"], "Engineer");
        assert_eq!(value["originalEventName"], "SubagentStart");
    }

    #[test]
    fn test_legacy_table() {
        let cases = [
            ("SubagentStop", "subagent", "stop", Route::Generic),
            ("UserPrompt", "hook", "user_prompt", Route::Hook),
            ("ToolCall", "tool", "call", Route::Generic),
            ("MemoryFlush", "system", "memoryflush", Route::Generic),
        ];
        for (name, event_type, subtype, expected_route) in cases {
            let n = route(&json!({ "event": name }));
            assert_eq!(n.envelope.event_type, event_type, "{name}");
            assert_eq!(n.envelope.subtype, subtype, "{name}");
            assert_eq!(n.route, expected_route, "{name}");
            assert_eq!(n.envelope.original_event_name, name);
        }
    }

    #[test]
    fn test_type_takes_precedence_over_legacy_event() {
        let n = route(&json!({"type": "session.started", "event": "SubagentStart"}));
        assert_eq!(n.envelope.event_type, "session");
        assert_eq!(n.envelope.subtype, "started");
        assert!(n.envelope.fields.get("event").is_none());
    }

    #[test]
    fn test_dotted_split_on_first_dot() {
        let env = normalize(&json!({"type": "session.agent.delegated"}));
        assert_eq!(env.event_type, "session");
        assert_eq!(env.subtype, "agent.delegated");
    }

    #[test]
    fn test_plain_type_keeps_explicit_subtype() {
        let env = normalize(&json!({"type": "session", "subtype": "started"}));
        assert_eq!(env.event_type, "session");
        assert_eq!(env.subtype, "started");
    }

    #[test]
    fn test_malformed_inputs_degrade_to_unknown() {
        for raw in [
            json!({"type": 42}),
            json!({"type": ""}),
            json!({}),
            json!("not an object"),
            json!(null),
        ] {
            let env = normalize(&raw);
            assert_eq!(env.event_type, "unknown", "{raw}");
            assert_eq!(env.subtype, "");
        }
    }

    #[test]
    fn test_non_map_data_is_kept_but_not_flattened() {
        let env = normalize(&json!({"type": "status", "data": [1, 2, 3]}));
        assert_eq!(env.data, json!([1, 2, 3]));
        assert!(env.fields.is_empty());
    }

    #[test]
    fn test_protected_fields_never_overwritten() {
        let raw = json!({
            "type": "hook.post_tool",
            "timestamp": "2026-01-01T00:00:00Z",
            "id": "evt-1",
            "data": {
                "type": "evil",
                "subtype": "evil",
                "timestamp": "1999-01-01T00:00:00Z",
                "id": "evil",
                "event": "evil",
                "event_type": "evil",
                "originalEventName": "evil",
                "exit_code": 0
            }
        });
        let n = route(&raw);
        let env = &n.envelope;

        assert_eq!(env.event_type, "hook");
        assert_eq!(env.subtype, "post_tool");
        assert_eq!(env.timestamp, "2026-01-01T00:00:00Z");
        assert_eq!(env.id.as_deref(), Some("evt-1"));
        assert_eq!(env.original_event_name, "hook.post_tool");
        assert_eq!(n.skipped.len(), PROTECTED_KEYS.len());
        assert_eq!(env.field("exit_code"), Some(&json!(0)));

        let value = serde_json::to_value(env).unwrap();
        assert_eq!(value["type"], "hook");
        assert!(value.get("event").is_none());
        assert!(value.get("event_type").is_none());
        // Nested copy is untouched
        assert_eq!(value["data"]["type"], "evil");
    }

    #[test]
    fn test_timestamp_assigned_when_missing() {
        let env = normalize(&json!({"type": "system.ping"}));
        assert!(chrono::DateTime::parse_from_rfc3339(&env.timestamp).is_ok());
    }

    #[test]
    fn test_numeric_id_is_stringified() {
        let env = normalize(&json!({"type": "x", "id": 7}));
        assert_eq!(env.id.as_deref(), Some("7"));
    }

    #[test]
    fn test_top_level_extras_win_over_data() {
        let env = normalize(&json!({
            "type": "hook.pre_tool",
            "session_id": "outer",
            "data": {"session_id": "inner"}
        }));
        assert_eq!(env.session_id(), Some("outer"));
        assert_eq!(env.data["session_id"], "inner");
    }
}
