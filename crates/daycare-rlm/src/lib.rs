//! # daycare-rlm
//!
//! Runs model-written scripts in an isolated, pausable interpreter.
//!
//! A script block runs inside a worker (usually a subprocess). Whenever the
//! script calls a host function the worker pauses and hands back a snapshot;
//! the [`RlmExecutor`] records that snapshot, runs the tool, and resumes the
//! worker with the result. Because the snapshot is written before the tool
//! runs, a crashed host can pick the block up again with [`RlmExecutor::restore`].
//!
//! ```text
//!   RlmExecutor ──start/resume──▶ RlmWorkers ──JSON lines──▶ worker process
//!        │                                                      (Interpreter)
//!        ├── checkpoint ──▶ history (rlm_start / rlm_tool_call / rlm_complete)
//!        └── execute ─────▶ ToolResolver
//! ```

pub mod bridge;
pub(crate) mod client;
pub mod convert;
pub mod execute;
pub mod extract;
pub mod preamble;
pub mod process;
pub mod protocol;
pub mod scripted;
pub mod worker;

pub use bridge::{RlmWorkers, WorkerFactory, WorkerHandle};
pub use convert::{args_convert, print_line, result_convert, value_format};
pub use execute::{
    CheckpointFn, RESTART_MESSAGE, RlmExecuteResult, RlmExecutor, RlmHooks, SteeringFn,
    SteeringInterrupt, TURN_SKIPPED, error_complete_record, steering_report,
};
pub use extract::{
    RUN_PYTHON_CLOSE, RUN_PYTHON_TOOL, ScriptBlock, extract_blocks, failure_trim, message_blocks,
    terminal_trim,
};
pub use preamble::{SKIP_FUNCTION, preamble_build};
pub use process::{ProcessWorker, ProcessWorkerFactory};
pub use protocol::{Progress, ResumeRequest, ResumeValue, StartRequest, WorkerError};
pub use scripted::ScriptedInterpreter;
pub use worker::{InProcessWorkerFactory, Interpreter, serve};
