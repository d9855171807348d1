//! Wire format spoken between the host and an interpreter worker.
//!
//! One JSON object per line in each direction. Requests carry a numeric id that
//! the matching response echoes back:
//!
//! ```text
//! → {"type":"start","id":1,"payload":{"code":"…","preamble":"…","external_functions":["echo"],"limits":{…}}}
//! ← {"status":"ok","id":1,"progress":{"type":"suspended","snapshot":"…","function_name":"echo","args":["x"],"kwargs":{},"printed":[]}}
//! → {"type":"resume","id":2,"payload":{"snapshot":"…","value":{"type":"return","value":"x"},"limits":{…}}}
//! ← {"status":"error","id":2,"error":{"kind":"runtime","message":"Python runtime error.","details":"…"}}
//! ```

use daycare_core::{DaycareError, InterpreterErrorKind, RlmLimits, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where a script stands after a start or resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Progress {
    /// The script ran to the end; `output` is the value of its last expression.
    Complete {
        output: Value,
        #[serde(default)]
        printed: Vec<String>,
    },
    /// The script paused on a host function call.
    Suspended {
        snapshot: Snapshot,
        function_name: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
        /// Lines printed since the previous progress report.
        #[serde(default)]
        printed: Vec<String>,
    },
}

impl Progress {
    pub fn printed(&self) -> &[String] {
        match self {
            Self::Complete { printed, .. } | Self::Suspended { printed, .. } => printed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub code: String,
    pub preamble: String,
    /// Names the script may call as host functions.
    pub external_functions: Vec<String>,
    pub limits: RlmLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub snapshot: Snapshot,
    pub value: ResumeValue,
    /// Sent again so that time spent paused never counts against the budget.
    pub limits: RlmLimits,
}

/// What the paused host function call evaluates to inside the script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResumeValue {
    Return { value: Value },
    /// Raised at the call site; the script may catch it.
    Exception { kind: String, message: String },
}

impl ResumeValue {
    pub fn value(value: Value) -> Self {
        Self::Return { value }
    }

    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::Exception {
            kind: "RuntimeError".into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Start { id: u64, payload: StartRequest },
    Resume { id: u64, payload: ResumeRequest },
}

impl WorkerRequest {
    pub fn id(&self) -> u64 {
        match self {
            Self::Start { id, .. } | Self::Resume { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ok { id: u64, progress: Progress },
    Error { id: u64, error: WorkerError },
}

impl WorkerResponse {
    pub fn id(&self) -> u64 {
        match self {
            Self::Ok { id, .. } | Self::Error { id, .. } => *id,
        }
    }

    pub fn into_result(self) -> daycare_core::Result<Progress> {
        match self {
            Self::Ok { progress, .. } => Ok(progress),
            Self::Error { error, .. } => Err(error.into()),
        }
    }
}

/// A failure reported by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerError {
    pub kind: InterpreterErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl WorkerError {
    pub fn new(kind: InterpreterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn syntax(details: impl Into<String>) -> Self {
        Self::new(InterpreterErrorKind::Syntax, "Python syntax error.").with_details(details)
    }

    pub fn runtime(details: impl Into<String>) -> Self {
        Self::new(InterpreterErrorKind::Runtime, "Python runtime error.").with_details(details)
    }

    pub fn typing(details: impl Into<String>) -> Self {
        Self::new(InterpreterErrorKind::Typing, "Python type check failed.").with_details(details)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(InterpreterErrorKind::Internal, message)
    }
}

impl From<WorkerError> for DaycareError {
    fn from(e: WorkerError) -> Self {
        DaycareError::Interpreter {
            kind: e.kind,
            message: e.message,
            details: e.details,
        }
    }
}
