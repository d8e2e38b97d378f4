//! Canonical hook sub-events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hook sub-events, identified by the subtype of a `hook.*` event.
///
/// Interceptors in the agent execution path emit these around tool calls,
/// prompts and session boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// Before a tool is executed
    PreTool,

    /// After a tool completes execution
    PostTool,

    /// A user prompt was submitted
    UserPrompt,

    /// The agent finished responding
    Stop,

    /// A delegated subagent started
    SubagentStart,

    /// A delegated subagent finished
    SubagentStop,

    /// A session started
    SessionStart,

    /// A session ended
    SessionEnd,

    /// Informational notification
    Notification,

    /// A tool or the agent reported a failure
    Error,
}

impl HookKind {
    /// Parses from a hook subtype (`pre_tool`, `session_start`, ...).
    ///
    /// The PascalCase names used by Claude Code hook payloads
    /// (`PreToolUse`, `SessionStart`, ...) are accepted as aliases.
    pub fn from_subtype(subtype: &str) -> Option<Self> {
        match subtype {
            "pre_tool" | "PreToolUse" => Some(Self::PreTool),
            "post_tool" | "PostToolUse" => Some(Self::PostTool),
            "user_prompt" | "UserPromptSubmit" => Some(Self::UserPrompt),
            "stop" | "Stop" => Some(Self::Stop),
            "subagent_start" | "SubagentStart" => Some(Self::SubagentStart),
            "subagent_stop" | "SubagentStop" => Some(Self::SubagentStop),
            "session_start" | "SessionStart" => Some(Self::SessionStart),
            "session_end" | "SessionEnd" => Some(Self::SessionEnd),
            "notification" | "Notification" => Some(Self::Notification),
            "error" | "PostToolUseFailure" => Some(Self::Error),
            _ => None,
        }
    }

    /// Returns the canonical subtype string.
    pub fn as_subtype(&self) -> &'static str {
        match self {
            Self::PreTool => "pre_tool",
            Self::PostTool => "post_tool",
            Self::UserPrompt => "user_prompt",
            Self::Stop => "stop",
            Self::SubagentStart => "subagent_start",
            Self::SubagentStop => "subagent_stop",
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::Notification => "notification",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_subtype())
    }
}
