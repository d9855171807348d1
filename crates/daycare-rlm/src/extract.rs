//! Finding script blocks in model output.
//!
//! A model can ask for code to run in two ways: inline `<run_python>` tags in
//! its text, or native `run_python` tool calls whose `code` argument holds the
//! script.

use daycare_core::ToolCall;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

/// Name of the tool and of the tag that carry a script block.
pub const RUN_PYTHON_TOOL: &str = "run_python";

/// Inference stop sequence: the model stops after closing its first block.
pub const RUN_PYTHON_CLOSE: &str = "</run_python>";

const RUN_PYTHON_OPEN: &str = "<run_python>";

// An unterminated trailing block is accepted: the stop sequence eats the close tag.
static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<run_python>(.*?)(?:</run_python>|\z)").expect("valid block regex")
});

/// A script block with the id of the tool call it came from, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptBlock {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Script bodies of every `<run_python>` block in `text`, in order. Blank blocks
/// are dropped.
pub fn extract_blocks(text: &str) -> Vec<String> {
    BLOCK_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|code| !code.is_empty())
        .collect()
}

/// Script blocks carried by `run_python` tool calls.
pub fn blocks_from_tool_calls(tool_calls: &[ToolCall]) -> Vec<ScriptBlock> {
    tool_calls
        .iter()
        .filter(|call| call.tool_name == RUN_PYTHON_TOOL)
        .filter_map(|call| {
            let code = call.arguments.get("code").and_then(Value::as_str)?;
            if code.trim().is_empty() {
                return None;
            }
            Some(ScriptBlock {
                code: code.to_string(),
                tool_call_id: Some(call.id.clone()),
            })
        })
        .collect()
}

/// Every block of an assistant message: tool-call blocks when present, tag
/// blocks otherwise.
pub fn message_blocks(text: &str, tool_calls: &[ToolCall]) -> Vec<ScriptBlock> {
    let from_calls = blocks_from_tool_calls(tool_calls);
    if !from_calls.is_empty() {
        return from_calls;
    }
    extract_blocks(text)
        .into_iter()
        .map(|code| ScriptBlock {
            code,
            tool_call_id: None,
        })
        .collect()
}

/// Cut everything after the first `</run_python>`. `None` when nothing follows it.
pub fn terminal_trim(text: &str) -> Option<String> {
    let end = text.find(RUN_PYTHON_CLOSE)? + RUN_PYTHON_CLOSE.len();
    if text[end..].trim().is_empty() {
        return None;
    }
    Some(text[..end].to_string())
}

/// Keep the text up to the end of block `block_index`, dropping the blocks the
/// failure prevented from running. `None` when nothing would change.
pub fn failure_trim(text: &str, block_index: usize) -> Option<String> {
    let block = BLOCK_RE
        .find_iter(text)
        .filter(|m| {
            let inner = m
                .as_str()
                .trim_start_matches(RUN_PYTHON_OPEN)
                .trim_end_matches(RUN_PYTHON_CLOSE);
            !inner.trim().is_empty()
        })
        .nth(block_index)?;
    if text[block.end()..].trim().is_empty() {
        return None;
    }
    Some(text[..block.end()].to_string())
}
