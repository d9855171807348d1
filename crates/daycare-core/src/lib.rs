//! # daycare-core
//!
//! Core types, traits, and primitives for the Daycare agent runtime.
//! This crate defines the shared vocabulary used by every other crate in the workspace:
//! the error type, history records, tool contracts, and the event bus.

pub mod error;
pub mod event;
pub mod history;
pub mod message;
pub mod tool;
pub mod types;

pub use error::{DaycareError, InterpreterErrorKind, Result};
pub use event::{Event, EventBus};
pub use history::{HistoryRecord, RlmCompleteRecord, RlmStartRecord, RlmToolCallRecord};
pub use message::{Message, MessageContent, Role};
pub use tool::{Tool, ToolCall, ToolExecutionContext, ToolResolver, ToolResult};
pub use types::*;
