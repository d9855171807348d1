//! Working out, from history alone, what a crashed process left unfinished.

use daycare_core::{HistoryRecord, Millis, RlmStartRecord, RlmToolCallRecord};
use daycare_rlm::{ScriptBlock, message_blocks};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Message of the error that closes a block which never reached a checkpoint.
pub const RESTARTED_BEFORE_TOOL_CALL: &str = "Process was restarted before any tool call";

/// Where execution should pick up after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingPhase {
    /// The model asked for blocks that never started. Run them from `block_index`.
    ScriptStart {
        blocks: Vec<ScriptBlock>,
        block_index: usize,
        assistant_at: Millis,
        history_text: String,
    },
    /// A block stopped inside a host call. Resume it from `snapshot`.
    ToolCall {
        start: RlmStartRecord,
        snapshot: RlmToolCallRecord,
        blocks: Vec<ScriptBlock>,
        block_index: usize,
        assistant_at: Millis,
        history_text: String,
    },
    /// A block started but left no checkpoint to resume from. It is closed
    /// with `message`; the blocks after `block_index` do not run.
    RecoveryError {
        start: RlmStartRecord,
        message: String,
        blocks: Vec<ScriptBlock>,
        block_index: usize,
        assistant_at: Millis,
        history_text: String,
    },
}

impl PendingPhase {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ScriptStart { .. } => "script_start",
            Self::ToolCall { .. } => "tool_call",
            Self::RecoveryError { .. } => "recovery_error",
        }
    }
}

/// An assistant message that asked for script blocks, with rewrites applied.
#[derive(Debug, Clone)]
struct AssistantBlocks {
    index: usize,
    assistant_at: Millis,
    history_text: String,
    blocks: Vec<ScriptBlock>,
}

/// Compute the pending phase of an agent from its history, oldest record first.
///
/// Looks for the newest script chain without an `rlm_complete`. If there is
/// none, the newest assistant message with blocks that no `rlm_start` follows
/// is still waiting to run. Pure: the same history always gives the same answer.
pub fn resolve_pending_phase(records: &[HistoryRecord]) -> Option<PendingPhase> {
    let mut starts: HashMap<&str, (usize, &RlmStartRecord)> = HashMap::new();
    let mut completed: HashSet<&str> = HashSet::new();
    for (index, record) in records.iter().enumerate() {
        match record {
            HistoryRecord::RlmStart(start) => {
                starts.insert(start.tool_call_id.as_str(), (index, start));
            }
            HistoryRecord::RlmComplete(complete) => {
                completed.insert(complete.tool_call_id.as_str());
            }
            _ => {}
        }
    }

    let pending = starts
        .values()
        .filter(|(_, start)| !completed.contains(start.tool_call_id.as_str()))
        .max_by_key(|(index, start)| (start.at, *index))
        .map(|(_, start)| *start);

    if let Some(start) = pending {
        return Some(resume_open_chain(records, start));
    }

    let latest = latest_assistant_blocks(records)?;
    let started_later = records[latest.index + 1..]
        .iter()
        .any(|r| matches!(r, HistoryRecord::RlmStart(_)));
    if started_later {
        return None;
    }
    Some(PendingPhase::ScriptStart {
        blocks: latest.blocks,
        block_index: 0,
        assistant_at: latest.assistant_at,
        history_text: latest.history_text,
    })
}

fn resume_open_chain(records: &[HistoryRecord], start: &RlmStartRecord) -> PendingPhase {
    let snapshot = records
        .iter()
        .enumerate()
        .filter_map(|(index, record)| match record {
            HistoryRecord::RlmToolCall(call) if call.tool_call_id == start.tool_call_id => Some((index, call)),
            _ => None,
        })
        .max_by_key(|(index, call)| (call.at, *index))
        .map(|(_, call)| call.clone());

    let assistant = assistant_for_start(records, start);
    let (blocks, assistant_at, history_text) = match assistant {
        Some(a) => (a.blocks, a.assistant_at, a.history_text),
        None => (
            vec![ScriptBlock {
                code: start.code.clone(),
                tool_call_id: Some(start.tool_call_id.clone()),
            }],
            start.at,
            String::new(),
        ),
    };
    let block_index = blocks
        .iter()
        .position(|b| b.tool_call_id.as_deref() == Some(start.tool_call_id.as_str()))
        .or_else(|| blocks.iter().position(|b| b.code == start.code))
        .unwrap_or(0);

    match snapshot {
        Some(snapshot) => PendingPhase::ToolCall {
            start: start.clone(),
            snapshot,
            blocks,
            block_index,
            assistant_at,
            history_text,
        },
        None => PendingPhase::RecoveryError {
            start: start.clone(),
            message: RESTARTED_BEFORE_TOOL_CALL.to_string(),
            blocks,
            block_index,
            assistant_at,
            history_text,
        },
    }
}

/// The assistant message most likely to have produced `start`: among those at
/// or before it, newest first, prefer a tool-call id match, then a code match.
fn assistant_for_start(records: &[HistoryRecord], start: &RlmStartRecord) -> Option<AssistantBlocks> {
    let mut candidates = assistant_blocks(records, Some(start.at));
    candidates.sort_by(|a, b| (b.assistant_at, b.index).cmp(&(a.assistant_at, a.index)));

    let by_id = candidates.iter().position(|c| {
        c.blocks
            .iter()
            .any(|b| b.tool_call_id.as_deref() == Some(start.tool_call_id.as_str()))
    });
    let by_code = || candidates.iter().position(|c| c.blocks.iter().any(|b| b.code == start.code));
    let chosen = by_id.or_else(by_code).unwrap_or(0);
    if chosen < candidates.len() {
        Some(candidates.swap_remove(chosen))
    } else {
        None
    }
}

fn latest_assistant_blocks(records: &[HistoryRecord]) -> Option<AssistantBlocks> {
    assistant_blocks(records, None).into_iter().max_by_key(|c| c.index)
}

/// Assistant messages with at least one block, optionally only those at or
/// before `until`, with the latest rewrite of each applied.
fn assistant_blocks(records: &[HistoryRecord], until: Option<Millis>) -> Vec<AssistantBlocks> {
    let in_range = |at: Millis| until.is_none_or(|limit| at <= limit);
    let mut out: Vec<AssistantBlocks> = Vec::new();
    for (index, record) in records.iter().enumerate() {
        match record {
            HistoryRecord::AssistantMessage {
                at,
                text,
                tool_calls,
                ..
            } if in_range(*at) => {
                let blocks = message_blocks(text, tool_calls);
                if !blocks.is_empty() {
                    out.push(AssistantBlocks {
                        index,
                        assistant_at: *at,
                        history_text: text.clone(),
                        blocks,
                    });
                }
            }
            HistoryRecord::AssistantRewrite {
                assistant_at, text, ..
            } if in_range(*assistant_at) => {
                for candidate in out.iter_mut().filter(|c| c.assistant_at == *assistant_at) {
                    candidate.history_text = text.clone();
                }
            }
            _ => {}
        }
    }
    out
}
