use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::AgentId;

/// Description of a tool that an agent's scripts can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Unique name; also the host function name exposed to scripts.
    pub name: String,
    /// Human-readable description for the model.
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

/// A request to call a tool, from the model or from a running script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// The result of executing a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
    /// Optional structured data returned alongside the text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolResult {
    pub fn success(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
            data: None,
        }
    }

    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::success(tool_call_id, content)
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Who is asking for a tool to run, and on behalf of what.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionContext {
    pub agent_id: AgentId,
    /// Connector or subsystem the triggering message arrived from.
    pub source: String,
    #[serde(default)]
    pub message_id: Option<String>,
    /// Set when the call originates inside a running script block.
    #[serde(default)]
    pub python_execution: bool,
}

/// Trait implemented by anything that can list and execute tools for an agent.
#[async_trait]
pub trait ToolResolver: Send + Sync {
    /// List all tools this resolver provides.
    fn list_tools(&self) -> Vec<Tool>;

    /// Execute a single tool call and return the result.
    ///
    /// A tool that ran and failed reports `is_error: true`; an `Err` means the
    /// resolver itself could not carry out the call.
    async fn execute(
        &self,
        call: &ToolCall,
        context: &ToolExecutionContext,
    ) -> crate::Result<ToolResult>;
}
