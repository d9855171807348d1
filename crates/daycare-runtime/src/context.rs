//! Building the model's view of the conversation from history.

use daycare_core::{HistoryRecord, Message, MessageContent, Millis, RlmCompleteRecord, Role, Tool};
use daycare_llm::InferenceContext;
use daycare_rlm::RUN_PYTHON_TOOL;
use daycare_rlm::extract::blocks_from_tool_calls;
use serde_json::json;
use std::collections::{HashMap, HashSet};

/// Turns persisted history into the context for the next model call.
pub trait ContextBuilder: Send + Sync {
    /// `history` is the effective history, oldest first. `preamble` declares
    /// the host functions scripts can call.
    fn build(&self, history: &[HistoryRecord], preamble: &str) -> InferenceContext;
}

/// Default builder: everything since the latest reset, with assistant rewrites
/// applied and script results fed back as `<python_result>` messages.
#[derive(Debug, Clone, Default)]
pub struct HistoryContextBuilder {
    system_prompt: Option<String>,
}

impl HistoryContextBuilder {
    pub fn new(system_prompt: Option<String>) -> Self {
        Self { system_prompt }
    }
}

impl ContextBuilder for HistoryContextBuilder {
    fn build(&self, history: &[HistoryRecord], preamble: &str) -> InferenceContext {
        let since = history
            .iter()
            .rposition(|r| matches!(r, HistoryRecord::Reset { .. }))
            .map_or(0, |i| i + 1);
        let records = &history[since..];

        let mut rewrites: HashMap<Millis, &str> = HashMap::new();
        for record in records {
            if let HistoryRecord::AssistantRewrite {
                assistant_at, text, ..
            } = record
            {
                rewrites.insert(*assistant_at, text);
            }
        }

        let mut native_calls: HashSet<String> = HashSet::new();
        let mut messages = Vec::new();
        for record in records {
            match record {
                HistoryRecord::UserMessage { at, text, files, .. } => {
                    let mut message = Message::text(Role::User, text.clone()).with_timestamp(*at);
                    message.content.extend(files.iter().map(|f| MessageContent::File {
                        path: f.path.clone(),
                        media_type: f.mime_type.clone(),
                    }));
                    messages.push(message);
                }
                HistoryRecord::AssistantMessage {
                    at,
                    text,
                    tool_calls,
                    ..
                } => {
                    let text = rewrites.get(at).copied().unwrap_or(text.as_str());
                    native_calls.extend(
                        blocks_from_tool_calls(tool_calls)
                            .into_iter()
                            .filter_map(|b| b.tool_call_id),
                    );
                    messages.push(Message::assistant(text, tool_calls.clone()).with_timestamp(*at));
                }
                HistoryRecord::ToolResult {
                    at,
                    tool_call_id,
                    content,
                    is_error,
                } => messages.push(tool_message(*at, tool_call_id, content.clone(), *is_error)),
                HistoryRecord::Note { at, text } => {
                    messages.push(Message::text(Role::User, text.clone()).with_timestamp(*at));
                }
                HistoryRecord::RlmComplete(complete) => {
                    let text = script_result_text(complete);
                    if native_calls.contains(&complete.tool_call_id) {
                        messages.push(tool_message(
                            complete.at,
                            &complete.tool_call_id,
                            text,
                            complete.is_error,
                        ));
                    } else {
                        messages.push(Message::text(Role::User, python_result(&text)).with_timestamp(complete.at));
                    }
                }
                _ => {}
            }
        }

        let system = [self.system_prompt.as_deref(), Some(preamble)]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        InferenceContext {
            system: (!system.is_empty()).then_some(system),
            messages,
            tools: vec![run_python_tool()],
        }
    }
}

/// The native tool through which models can submit a script.
pub fn run_python_tool() -> Tool {
    Tool {
        name: RUN_PYTHON_TOOL.to_string(),
        description: "Run a Python script. Call the functions declared in the system prompt to use tools; \
                      the value of the last expression is returned."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "code": { "type": "string", "description": "Python source to execute." }
            },
            "required": ["code"]
        }),
    }
}

/// What the model is told a finished block produced.
pub fn script_result_text(record: &RlmCompleteRecord) -> String {
    if record.is_error {
        let error = record.error.as_deref().unwrap_or(&record.output);
        return with_printed(&record.print_output, format!("Python execution failed.\n{error}"));
    }
    if record.output.starts_with("<python_result>") {
        return record.output.clone();
    }
    let output = if record.output.is_empty() {
        "(empty)"
    } else {
        record.output.as_str()
    };
    with_printed(&record.print_output, format!("Output: {output}"))
}

fn with_printed(print_output: &[String], body: String) -> String {
    if print_output.is_empty() {
        body
    } else {
        format!("Printed:\n{}\n\n{body}", print_output.join("\n"))
    }
}

fn python_result(text: &str) -> String {
    if text.starts_with("<python_result>") {
        text.to_string()
    } else {
        format!("<python_result>\n{text}\n</python_result>")
    }
}

fn tool_message(at: Millis, tool_call_id: &str, content: String, is_error: bool) -> Message {
    Message {
        role: Role::Tool,
        content: vec![MessageContent::ToolResult {
            tool_call_id: tool_call_id.to_string(),
            content,
            is_error,
        }],
        timestamp: at,
        tool_calls: vec![],
    }
}
