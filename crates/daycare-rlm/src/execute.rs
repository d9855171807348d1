use daycare_core::{
    DaycareError, HistoryRecord, Result, RlmCompleteRecord, RlmLimits, RlmStartRecord,
    RlmToolCallRecord, Tool, ToolCall, ToolExecutionContext, ToolResolver, new_tool_call_id,
    now_millis,
};
use futures::future::BoxFuture;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::bridge::RlmWorkers;
use crate::convert::{args_convert, result_convert, value_format};
use crate::extract::RUN_PYTHON_TOOL;
use crate::preamble::SKIP_FUNCTION;
use crate::protocol::{Progress, ResumeRequest, ResumeValue, StartRequest};

/// Exception injected when a script is resumed after a host restart.
pub const RESTART_MESSAGE: &str = "Process was restarted";

/// Output of a block ended by `skip()`.
pub const TURN_SKIPPED: &str = "Turn skipped";

/// Persists one checkpoint record. Must be durable before the future resolves.
pub type CheckpointFn = Arc<dyn Fn(HistoryRecord) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Takes the pending steering request, if any.
pub type SteeringFn = Arc<dyn Fn() -> Option<SteeringInterrupt> + Send + Sync>;

/// Callbacks into the owning agent.
#[derive(Clone, Default)]
pub struct RlmHooks {
    pub checkpoint: Option<CheckpointFn>,
    pub steering: Option<SteeringFn>,
}

/// An out-of-band request that stopped a block between tool calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteeringInterrupt {
    pub text: String,
    pub origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RlmExecuteResult {
    pub output: String,
    pub print_output: Vec<String>,
    pub tool_call_count: u32,
    /// The script called `skip()`.
    pub skip_turn: bool,
    pub steering_interrupt: Option<SteeringInterrupt>,
}

/// Runs script blocks through the worker pool, one checkpoint chain per block.
pub struct RlmExecutor {
    workers: Arc<RlmWorkers>,
    limits: RlmLimits,
}

struct Chain<'a> {
    tool_call_id: &'a str,
    tools: HashMap<String, Tool>,
    resolver: &'a dyn ToolResolver,
    context: ToolExecutionContext,
    hooks: &'a RlmHooks,
    print_output: Vec<String>,
    tool_call_count: u32,
}

impl RlmExecutor {
    pub fn new(workers: Arc<RlmWorkers>, limits: RlmLimits) -> Self {
        Self { workers, limits }
    }

    pub fn workers(&self) -> &Arc<RlmWorkers> {
        &self.workers
    }

    /// Run `code` from the start under the chain `tool_call_id`.
    pub async fn run(
        &self,
        code: &str,
        preamble: &str,
        context: &ToolExecutionContext,
        resolver: &dyn ToolResolver,
        tool_call_id: &str,
        hooks: &RlmHooks,
    ) -> Result<RlmExecuteResult> {
        let mut chain = Chain::new(tool_call_id, resolver, context, hooks, vec![], 0);
        info!(tool_call_id, "script block started");

        checkpoint(
            hooks,
            HistoryRecord::RlmStart(RlmStartRecord {
                at: now_millis(),
                tool_call_id: tool_call_id.to_string(),
                code: code.to_string(),
                preamble: preamble.to_string(),
            }),
        )
        .await?;

        let mut external_functions: Vec<String> = chain.tools.keys().cloned().collect();
        external_functions.sort();
        external_functions.push(SKIP_FUNCTION.to_string());

        let started = self
            .workers
            .start(
                tool_call_id,
                StartRequest {
                    code: code.to_string(),
                    preamble: preamble.to_string(),
                    external_functions,
                    limits: self.limits,
                },
            )
            .await;
        let result = self.drive(&mut chain, started).await;
        self.workers.stop_worker(tool_call_id).await;
        chain.close_on_error(result).await
    }

    /// Continue a block from its latest checkpoint after a restart.
    ///
    /// The interrupted host call raises [`RESTART_MESSAGE`] inside the script
    /// instead of returning, because its real result was never confirmed.
    pub async fn restore(
        &self,
        tool_call: &RlmToolCallRecord,
        start: &RlmStartRecord,
        resolver: &dyn ToolResolver,
        context: &ToolExecutionContext,
        hooks: &RlmHooks,
    ) -> Result<RlmExecuteResult> {
        let tool_call_id = start.tool_call_id.as_str();
        let mut chain = Chain::new(
            tool_call_id,
            resolver,
            context,
            hooks,
            tool_call.print_output.clone(),
            tool_call.tool_call_count,
        );
        info!(
            tool_call_id,
            function = %tool_call.function_name,
            "restoring script block from checkpoint"
        );

        let resumed = self
            .workers
            .resume(
                tool_call_id,
                ResumeRequest {
                    snapshot: tool_call.snapshot.clone(),
                    value: ResumeValue::runtime_error(RESTART_MESSAGE),
                    limits: self.limits,
                },
            )
            .await;
        let result = self.drive(&mut chain, resumed).await;
        self.workers.stop_worker(tool_call_id).await;
        chain.close_on_error(result).await
    }

    async fn drive(&self, chain: &mut Chain<'_>, first: Result<Progress>) -> Result<RlmExecuteResult> {
        let mut progress = match first {
            Ok(p) => p,
            Err(e) => return chain.fail(e).await,
        };

        loop {
            match progress {
                Progress::Complete { output, printed } => {
                    chain.print_output.extend(printed);
                    return chain.finish(value_format(&output), false, None).await;
                }
                Progress::Suspended {
                    snapshot,
                    function_name,
                    args,
                    kwargs,
                    printed,
                } => {
                    chain.print_output.extend(printed);

                    if function_name == SKIP_FUNCTION {
                        debug!(tool_call_id = chain.tool_call_id, "script skipped the turn");
                        return chain.finish(TURN_SKIPPED.to_string(), true, None).await;
                    }

                    let value = match chain.tools.get(&function_name).cloned() {
                        None => {
                            warn!(
                                tool_call_id = chain.tool_call_id,
                                function = %function_name,
                                "script called unknown tool"
                            );
                            ResumeValue::runtime_error(format!("ToolError: Unknown tool: {function_name}"))
                        }
                        Some(tool) => {
                            let converted = args_convert(&args, &kwargs, &tool);
                            let tool_args = match &converted {
                                Ok(v) => v.clone(),
                                Err(_) => json!({ "args": args, "kwargs": kwargs }),
                            };

                            checkpoint(
                                chain.hooks,
                                HistoryRecord::RlmToolCall(RlmToolCallRecord {
                                    at: now_millis(),
                                    tool_call_id: chain.tool_call_id.to_string(),
                                    snapshot: snapshot.clone(),
                                    function_name: function_name.clone(),
                                    args,
                                    kwargs,
                                    tool_args,
                                    print_output: chain.print_output.clone(),
                                    tool_call_count: chain.tool_call_count,
                                }),
                            )
                            .await?;
                            chain.tool_call_count += 1;

                            let (value, result_text, is_error) = chain.call_tool(&tool, converted).await;
                            checkpoint(
                                chain.hooks,
                                HistoryRecord::RlmToolResult {
                                    at: now_millis(),
                                    tool_call_id: chain.tool_call_id.to_string(),
                                    function_name: function_name.clone(),
                                    result: result_text,
                                    is_error,
                                },
                            )
                            .await?;

                            if let Some(steering) = chain.hooks.steering.as_ref().and_then(|f| f()) {
                                info!(tool_call_id = chain.tool_call_id, "script interrupted by steering");
                                let report = steering_report(&chain.print_output, &steering);
                                return chain.finish(report, false, Some(steering)).await;
                            }
                            value
                        }
                    };

                    let resumed = self
                        .workers
                        .resume(
                            chain.tool_call_id,
                            ResumeRequest {
                                snapshot,
                                value,
                                limits: self.limits,
                            },
                        )
                        .await;
                    progress = match resumed {
                        Ok(p) => p,
                        Err(e) => return chain.fail(e).await,
                    };
                }
            }
        }
    }
}

impl<'a> Chain<'a> {
    fn new(
        tool_call_id: &'a str,
        resolver: &'a dyn ToolResolver,
        context: &ToolExecutionContext,
        hooks: &'a RlmHooks,
        print_output: Vec<String>,
        tool_call_count: u32,
    ) -> Self {
        let tools = resolver
            .list_tools()
            .into_iter()
            .filter(|t| t.name != RUN_PYTHON_TOOL)
            .map(|t| (t.name.clone(), t))
            .collect();
        Self {
            tool_call_id,
            tools,
            resolver,
            context: ToolExecutionContext {
                python_execution: true,
                ..context.clone()
            },
            hooks,
            print_output,
            tool_call_count,
        }
    }

    /// Execute one tool for the script. Returns the resume value, the result
    /// text for the audit record, and whether it failed.
    async fn call_tool(
        &self,
        tool: &Tool,
        converted: std::result::Result<serde_json::Value, String>,
    ) -> (ResumeValue, String, bool) {
        let arguments = match converted {
            Ok(v) => v,
            Err(message) => {
                let text = format!("ToolError: {message}");
                return (ResumeValue::runtime_error(text.clone()), text, true);
            }
        };

        let call = ToolCall {
            id: new_tool_call_id(),
            tool_name: tool.name.clone(),
            arguments,
        };
        debug!(tool_call_id = self.tool_call_id, tool = %tool.name, "script tool call");

        match self.resolver.execute(&call, &self.context).await {
            Ok(result) => {
                let value = result_convert(&result);
                let text = value_format(&value);
                if result.is_error {
                    let message = if text.trim().is_empty() {
                        format!("Tool execution failed: {}", tool.name)
                    } else {
                        text.clone()
                    };
                    (ResumeValue::runtime_error(message), text, true)
                } else {
                    (ResumeValue::value(value), text, false)
                }
            }
            Err(e) => {
                let text = format!("ToolError: {e}");
                (ResumeValue::runtime_error(text.clone()), text, true)
            }
        }
    }

    async fn finish(
        &self,
        output: String,
        skip_turn: bool,
        steering_interrupt: Option<SteeringInterrupt>,
    ) -> Result<RlmExecuteResult> {
        checkpoint(
            self.hooks,
            HistoryRecord::RlmComplete(RlmCompleteRecord {
                at: now_millis(),
                tool_call_id: self.tool_call_id.to_string(),
                output: output.clone(),
                print_output: self.print_output.clone(),
                tool_call_count: self.tool_call_count,
                is_error: false,
                error: None,
            }),
        )
        .await?;
        info!(
            tool_call_id = self.tool_call_id,
            tool_calls = self.tool_call_count,
            "script block completed"
        );
        Ok(RlmExecuteResult {
            output,
            print_output: self.print_output.clone(),
            tool_call_count: self.tool_call_count,
            skip_turn,
            steering_interrupt,
        })
    }

    /// Close the chain with an error record and hand the error back.
    async fn fail(&self, error: DaycareError) -> Result<RlmExecuteResult> {
        warn!(tool_call_id = self.tool_call_id, error = %error, "script block failed");
        checkpoint(
            self.hooks,
            error_complete_record(
                self.tool_call_id,
                &error.script_message(),
                self.print_output.clone(),
                self.tool_call_count,
            ),
        )
        .await?;
        Err(error)
    }

    /// Close a chain that ended in a host-side error (a checkpoint that could
    /// not be written). Script errors were already closed by [`Chain::fail`].
    ///
    /// When the closing record cannot be written either, the chain stays open
    /// and the error becomes [`DaycareError::ChainLeftOpen`].
    async fn close_on_error(&self, result: Result<RlmExecuteResult>) -> Result<RlmExecuteResult> {
        let cause = match result {
            Err(e) if e.interpreter_kind().is_none() => e,
            other => return other,
        };
        warn!(tool_call_id = self.tool_call_id, error = %cause, "script block aborted, closing chain");
        let record = error_complete_record(
            self.tool_call_id,
            &cause.to_string(),
            self.print_output.clone(),
            self.tool_call_count,
        );
        match checkpoint(self.hooks, record).await {
            Ok(()) => Err(cause),
            Err(close_error) => {
                error!(
                    tool_call_id = self.tool_call_id,
                    error = %close_error,
                    "could not close script chain"
                );
                Err(DaycareError::ChainLeftOpen {
                    tool_call_id: self.tool_call_id.to_string(),
                    reason: format!("{cause}; closing failed: {close_error}"),
                })
            }
        }
    }
}

/// Terminal record for a chain that ended in an error.
pub fn error_complete_record(
    tool_call_id: &str,
    message: &str,
    print_output: Vec<String>,
    tool_call_count: u32,
) -> HistoryRecord {
    HistoryRecord::RlmComplete(RlmCompleteRecord {
        at: now_millis(),
        tool_call_id: tool_call_id.to_string(),
        output: String::new(),
        print_output,
        tool_call_count,
        is_error: true,
        error: Some(message.to_string()),
    })
}

/// The `<python_result>` shown to the model when steering stops a block.
pub fn steering_report(print_output: &[String], steering: &SteeringInterrupt) -> String {
    let printed = if print_output.is_empty() {
        String::new()
    } else {
        format!("Print output so far:\n{}\n\n", print_output.join("\n"))
    };
    format!(
        "<python_result>\nPython execution interrupted by steering.\n\n{printed}<steering_interrupt>\nMessage from {}: {}\n</steering_interrupt>\n</python_result>",
        steering.origin.as_deref().unwrap_or("system"),
        steering.text
    )
}

async fn checkpoint(hooks: &RlmHooks, record: HistoryRecord) -> Result<()> {
    match &hooks.checkpoint {
        Some(sink) => sink(record).await,
        None => Ok(()),
    }
}
