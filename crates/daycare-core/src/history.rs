use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tool::ToolCall;
use crate::types::{FileRef, Millis, Snapshot};

/// One append-only entry in an agent's history.
///
/// Script execution is recorded as a chain per `tool_call_id`:
/// `rlm_start`, then zero or more `rlm_tool_call`/`rlm_tool_result` pairs, then
/// exactly one `rlm_complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryRecord {
    // ── Conversation ───────────────────────────────────────────
    UserMessage {
        at: Millis,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files: Vec<FileRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    AssistantMessage {
        at: Millis,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    /// Replaces the text of the assistant message recorded at `assistant_at`.
    AssistantRewrite {
        at: Millis,
        assistant_at: Millis,
        text: String,
        reason: String,
    },
    ToolResult {
        at: Millis,
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
    Note {
        at: Millis,
        text: String,
    },
    /// Conversation context restarts after this record.
    Reset {
        at: Millis,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    // ── Script execution ───────────────────────────────────────
    RlmStart(RlmStartRecord),
    RlmToolCall(RlmToolCallRecord),
    RlmToolResult {
        at: Millis,
        tool_call_id: String,
        function_name: String,
        result: String,
        is_error: bool,
    },
    RlmComplete(RlmCompleteRecord),

    // ── Editing markers ────────────────────────────────────────
    /// Hides every record after the user message `message_id` up to this marker.
    HistoryTruncate {
        at: Millis,
        message_id: String,
        deleted_count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Blanks the text of the user message `message_id`.
    MessageRedact { at: Millis, message_id: String },
}

/// A script block began running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlmStartRecord {
    pub at: Millis,
    pub tool_call_id: String,
    pub code: String,
    pub preamble: String,
}

/// A script block paused to call a host function. Written before the tool runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlmToolCallRecord {
    pub at: Millis,
    pub tool_call_id: String,
    pub snapshot: Snapshot,
    pub function_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Arguments after mapping onto the tool's named parameters.
    #[serde(default)]
    pub tool_args: Value,
    #[serde(default)]
    pub print_output: Vec<String>,
    /// Tool calls completed before this one.
    pub tool_call_count: u32,
}

/// A script block finished, successfully or not. Terminal for its `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlmCompleteRecord {
    pub at: Millis,
    pub tool_call_id: String,
    pub output: String,
    #[serde(default)]
    pub print_output: Vec<String>,
    pub tool_call_count: u32,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryRecord {
    /// Timestamp of the record.
    pub fn at(&self) -> Millis {
        match self {
            Self::UserMessage { at, .. }
            | Self::AssistantMessage { at, .. }
            | Self::AssistantRewrite { at, .. }
            | Self::ToolResult { at, .. }
            | Self::Note { at, .. }
            | Self::Reset { at, .. }
            | Self::RlmToolResult { at, .. }
            | Self::HistoryTruncate { at, .. }
            | Self::MessageRedact { at, .. } => *at,
            Self::RlmStart(r) => r.at,
            Self::RlmToolCall(r) => r.at,
            Self::RlmComplete(r) => r.at,
        }
    }

    /// Script chain this record belongs to, for `rlm_*` records.
    pub fn rlm_tool_call_id(&self) -> Option<&str> {
        match self {
            Self::RlmStart(r) => Some(&r.tool_call_id),
            Self::RlmToolCall(r) => Some(&r.tool_call_id),
            Self::RlmToolResult { tool_call_id, .. } => Some(tool_call_id),
            Self::RlmComplete(r) => Some(&r.tool_call_id),
            _ => None,
        }
    }

    /// Short tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::AssistantMessage { .. } => "assistant_message",
            Self::AssistantRewrite { .. } => "assistant_rewrite",
            Self::ToolResult { .. } => "tool_result",
            Self::Note { .. } => "note",
            Self::Reset { .. } => "reset",
            Self::RlmStart(_) => "rlm_start",
            Self::RlmToolCall(_) => "rlm_tool_call",
            Self::RlmToolResult { .. } => "rlm_tool_result",
            Self::RlmComplete(_) => "rlm_complete",
            Self::HistoryTruncate { .. } => "history_truncate",
            Self::MessageRedact { .. } => "message_redact",
        }
    }
}
