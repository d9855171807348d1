use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure kinds surfaced by the script interpreter and the worker bridge around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpreterErrorKind {
    /// The script failed to parse.
    Syntax,
    /// The script raised an exception it did not handle.
    Runtime,
    /// Static type checking rejected the script.
    Typing,
    /// The interpreter itself failed (bad snapshot, limits misconfigured, ...).
    Internal,
    /// The worker process exited or could not be written to.
    WorkerCrash,
    /// The worker replied late, out of order, or with something unparseable.
    WorkerProtocol,
}

impl InterpreterErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Runtime => "runtime",
            Self::Typing => "typing",
            Self::Internal => "internal",
            Self::WorkerCrash => "worker_crash",
            Self::WorkerProtocol => "worker_protocol",
        }
    }
}

impl fmt::Display for InterpreterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the entire Daycare runtime.
#[derive(Error, Debug)]
pub enum DaycareError {
    // ── Agent errors ───────────────────────────────────────────
    #[error("agent error: {0}")]
    Agent(String),

    #[error("iteration limit reached: {0}")]
    IterationLimit(usize),

    // ── Inference errors ───────────────────────────────────────
    #[error("provider unavailable: {provider}: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("No inference provider available")]
    NoProviderAvailable,

    #[error("model call failed: {provider}: {reason}")]
    ModelCall { provider: String, reason: String },

    // ── Tool errors ────────────────────────────────────────────
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool execution failed: {tool}: {reason}")]
    ToolExecution { tool: String, reason: String },

    // ── Interpreter errors ─────────────────────────────────────
    #[error("interpreter error ({kind}): {message}")]
    Interpreter {
        kind: InterpreterErrorKind,
        message: String,
        details: Option<String>,
    },

    // ── History errors ─────────────────────────────────────────
    #[error("history error: {0}")]
    History(String),

    /// A script chain could not be closed in history. Serving more entries
    /// would open a second chain next to it.
    #[error("script chain {tool_call_id} left open: {reason}")]
    ChainLeftOpen { tool_call_id: String, reason: String },

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DaycareError {
    pub fn interpreter(kind: InterpreterErrorKind, message: impl Into<String>) -> Self {
        Self::Interpreter {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// The interpreter failure kind, if this error came from the script runtime.
    pub fn interpreter_kind(&self) -> Option<InterpreterErrorKind> {
        match self {
            Self::Interpreter { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Message suitable for showing to the model: the bare interpreter message
    /// plus details when present, or the display form otherwise.
    pub fn script_message(&self) -> String {
        match self {
            Self::Interpreter {
                message,
                details: Some(details),
                ..
            } if !details.is_empty() => format!("{message}\n{details}"),
            Self::Interpreter { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DaycareError>;
