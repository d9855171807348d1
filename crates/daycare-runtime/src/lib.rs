//! # daycare-runtime
//!
//! The agent runtime: one inbox and one loop task per agent.
//!
//! ```text
//!   post() ──▶ AgentInbox ──▶ loop task
//!                               │  1. append the user message
//!                               │  2. build context from history
//!                               │  3. InferenceRouter::complete
//!                               │  4. run each script block (RlmExecutor)
//!                               │  5. repeat until the model answers without blocks
//!                               ▼
//!                          HistoryStore
//! ```
//!
//! Every step lands in history before the next one starts, so after a crash
//! [`resolve_pending_phase`] can tell exactly where to pick up. The loop does
//! that first, through a `Restore` entry posted at the front of the inbox.

pub mod agent;
pub mod agent_loop;
pub mod builder;
pub mod context;
pub mod inbox;
pub mod pending_phase;

pub use agent::{Agent, AgentDeps, AgentOptions, system_message_text};
pub use builder::follow_config_reloads;
pub use agent_loop::{
    FAILURE_TRIM_REASON, LoopState, NOT_EXECUTED_FAILED, NOT_EXECUTED_SKIPPED, NOT_EXECUTED_STEERED,
};
pub use context::{ContextBuilder, HistoryContextBuilder, run_python_tool, script_result_text};
pub use inbox::{
    AgentInbox, Completion, InboxEntry, InboxItem, InboxOutcome, InboxResult, MessageContext,
    PostOptions, QueuedEntry, Steering,
};
pub use pending_phase::{PendingPhase, RESTARTED_BEFORE_TOOL_CALL, resolve_pending_phase};
