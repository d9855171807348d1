use serde::{Deserialize, Serialize};

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::AgentId;

/// Events emitted by running agents, for observers that don't own the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // ── Inference ──────────────────────────────────────────────
    InferenceAttempt {
        agent_id: AgentId,
        provider: String,
        model: String,
    },
    InferenceFallback {
        agent_id: AgentId,
        provider: String,
        reason: String,
    },
    InferenceCompleted {
        agent_id: AgentId,
        provider: String,
        model: String,
    },

    // ── Script execution ───────────────────────────────────────
    ScriptStarted {
        agent_id: AgentId,
        tool_call_id: String,
    },
    ScriptToolCall {
        agent_id: AgentId,
        tool_call_id: String,
        function_name: String,
    },
    ScriptCompleted {
        agent_id: AgentId,
        tool_call_id: String,
        tool_call_count: u32,
        is_error: bool,
    },

    // ── Agent lifecycle ────────────────────────────────────────
    AgentRestored {
        agent_id: AgentId,
        phase: String,
    },
    TurnCompleted {
        agent_id: AgentId,
    },
    AgentError {
        agent_id: AgentId,
        error: String,
    },
    Shutdown,
}

/// A broadcast-based event bus for system-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
