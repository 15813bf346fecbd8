//! Push-channel events.
//!
//! Every event is a JSON object `{type, sessionId, ...}` delivered in order
//! over a text stream (SSE in the gateway, stdout in the CLI). Within one
//! turn the order is:
//!
//! - `connected`  : once, first
//! - `iteration`  : once per engine call, 1-based
//! - `text_delta` / `thinking_delta` / `tool_use` / `tool_result`: as they happen
//! - exactly one terminal event: `completion`, `warning`, or `error`

use grantwell_core::AgentType;
use grantwell_core::provider::Usage;
use serde::{Deserialize, Serialize};

/// One push event, tagged with the stream session it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "sessionId")]
    pub session_id: String,

    #[serde(flatten)]
    pub kind: PushEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum PushEventKind {
    Connected {
        conversation_id: String,
        agent_type: AgentType,
    },

    Iteration {
        iteration: u32,
        max_iterations: u32,
    },

    TextDelta {
        index: usize,
        text: String,
    },

    ThinkingDelta {
        index: usize,
        thinking: String,
    },

    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    ToolResult {
        tool_use_id: String,
        name: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Terminal for a truncated turn; the content was still persisted.
    Warning {
        conversation_id: String,
        message: String,
        iterations: u32,
        persisted: bool,
    },

    Error {
        conversation_id: String,
        kind: String,
        message: String,
        iterations: u32,
    },

    Completion {
        conversation_id: String,
        state: String,
        iterations: u32,
        persisted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
}

impl PushEventKind {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Iteration { .. } => "iteration",
            Self::TextDelta { .. } => "text_delta",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::Warning { .. } => "warning",
            Self::Error { .. } => "error",
            Self::Completion { .. } => "completion",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Warning { .. } | Self::Error { .. } | Self::Completion { .. }
        )
    }
}

impl PushEvent {
    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}
