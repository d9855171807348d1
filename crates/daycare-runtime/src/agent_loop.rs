use daycare_core::{
    DaycareError, Event, HistoryRecord, Millis, ProviderSettings, Result, ToolExecutionContext,
    new_tool_call_id, now_millis,
};
use daycare_llm::{InferenceResponse, RouteOptions};
use daycare_llm::router::{AttemptHook, FailureHook, FallbackHook, SuccessHook};
use daycare_rlm::{
    CheckpointFn, RUN_PYTHON_CLOSE, RlmExecuteResult, RlmHooks, ScriptBlock, SteeringFn,
    SteeringInterrupt, error_complete_record, failure_trim, message_blocks, preamble_build,
    terminal_trim,
};
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::agent::AgentShared;
use crate::inbox::InboxResult;
use crate::pending_phase::{PendingPhase, resolve_pending_phase};

/// `assistant_rewrite` reason for text cut after a failed block.
pub const FAILURE_TRIM_REASON: &str = "run_python_failure_trim";

/// Tool result for a `run_python` call that never ran.
pub const NOT_EXECUTED_FAILED: &str = "Not executed: an earlier run_python call failed.";
pub const NOT_EXECUTED_STEERED: &str = "Not executed: an earlier run_python call was interrupted by steering.";
pub const NOT_EXECUTED_SKIPPED: &str = "Not executed: the turn was skipped.";

/// Where an agent's loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Recovering,
    AwaitingInboxEntry,
    BuildingContext,
    CallingModel,
    /// Running the block at this index of the current assistant message.
    ExecutingBlocks(usize),
    Persisting,
}

/// How a run of blocks ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlocksOutcome {
    Completed,
    /// A script called `skip()`: the turn ends without a reply.
    Skipped,
    /// Steering stopped a block; the model reacts on the next iteration.
    Steered,
    /// A block failed; the model sees the error on the next iteration.
    Failed,
}

enum Step {
    Continue,
    Done(InboxResult),
}

impl AgentShared {
    /// Call the model, run the blocks it asks for, and repeat until it answers
    /// without blocks.
    pub(crate) async fn run_turn(&self, context: &ToolExecutionContext) -> Result<InboxResult> {
        let max_iterations = self.options.max_iterations;
        for iteration in 1..=max_iterations {
            debug!(agent_id = %self.id, iteration, "inference iteration");
            match self.iterate(context).await? {
                Step::Continue => continue,
                Step::Done(result) => return Ok(result),
            }
        }
        warn!(agent_id = %self.id, max_iterations, "iteration limit reached, ending turn");
        Ok(InboxResult::default())
    }

    async fn iterate(&self, context: &ToolExecutionContext) -> Result<Step> {
        self.set_state(LoopState::BuildingContext);
        let preamble = preamble_build(&self.deps.tools.list_tools());
        let history = self.deps.history.read_all(&self.id).await?;
        let inference_context = self.deps.context_builder.build(&history, &preamble);

        self.set_state(LoopState::CallingModel);
        let inference = match self
            .deps
            .router
            .complete(&inference_context, &self.id, self.route_options())
            .await
        {
            Ok(inference) => inference,
            Err(e) => return Err(self.inference_failed(e).await),
        };

        let message = inference.response.message;
        let raw = message.text_content();
        let text = terminal_trim(&raw).unwrap_or(raw);
        let blocks = message_blocks(&text, &message.tool_calls);

        self.set_state(LoopState::Persisting);
        let assistant_at = now_millis();
        self.append(HistoryRecord::AssistantMessage {
            at: assistant_at,
            text: text.clone(),
            tool_calls: message.tool_calls,
            provider: Some(inference.provider_id),
            model: Some(inference.model_id),
        })
        .await?;

        if blocks.is_empty() {
            let response_text = (!text.trim().is_empty()).then_some(text);
            return Ok(Step::Done(InboxResult {
                response_text,
                skipped: false,
            }));
        }

        let outcome = self
            .run_blocks(&blocks, 0, assistant_at, &text, &preamble, context)
            .await?;
        Ok(match outcome {
            BlocksOutcome::Skipped => Step::Done(InboxResult {
                response_text: None,
                skipped: true,
            }),
            BlocksOutcome::Completed | BlocksOutcome::Steered | BlocksOutcome::Failed => Step::Continue,
        })
    }

    /// Run `blocks[from..]` in order, one checkpoint chain each.
    pub(crate) async fn run_blocks(
        &self,
        blocks: &[ScriptBlock],
        from: usize,
        assistant_at: Millis,
        history_text: &str,
        preamble: &str,
        context: &ToolExecutionContext,
    ) -> Result<BlocksOutcome> {
        let hooks = self.rlm_hooks();
        for (index, block) in blocks.iter().enumerate().skip(from) {
            self.set_state(LoopState::ExecutingBlocks(index));
            let tool_call_id = block.tool_call_id.clone().unwrap_or_else(new_tool_call_id);
            self.deps.events.publish(Event::ScriptStarted {
                agent_id: self.id.clone(),
                tool_call_id: tool_call_id.clone(),
            });

            let run = self
                .deps
                .executor
                .run(
                    &block.code,
                    preamble,
                    context,
                    self.deps.tools.as_ref(),
                    &tool_call_id,
                    &hooks,
                )
                .await;
            if let Some(outcome) = self
                .settle_block(blocks, index, assistant_at, history_text, &tool_call_id, run)
                .await?
            {
                return Ok(outcome);
            }
        }
        Ok(BlocksOutcome::Completed)
    }

    /// Book-keeping after one block. `None` means carry on with the next block.
    async fn settle_block(
        &self,
        blocks: &[ScriptBlock],
        index: usize,
        assistant_at: Millis,
        history_text: &str,
        tool_call_id: &str,
        run: Result<RlmExecuteResult>,
    ) -> Result<Option<BlocksOutcome>> {
        match run {
            Ok(result) => {
                self.deps.events.publish(Event::ScriptCompleted {
                    agent_id: self.id.clone(),
                    tool_call_id: tool_call_id.to_string(),
                    tool_call_count: result.tool_call_count,
                    is_error: false,
                });
                let outcome = if result.skip_turn {
                    BlocksOutcome::Skipped
                } else if result.steering_interrupt.is_some() {
                    BlocksOutcome::Steered
                } else {
                    return Ok(None);
                };
                self.close_remaining_blocks(blocks, index, assistant_at, history_text, outcome)
                    .await?;
                Ok(Some(outcome))
            }
            Err(e) => {
                self.deps.events.publish(Event::ScriptCompleted {
                    agent_id: self.id.clone(),
                    tool_call_id: tool_call_id.to_string(),
                    tool_call_count: 0,
                    is_error: true,
                });
                if e.interpreter_kind().is_some() {
                    self.close_remaining_blocks(blocks, index, assistant_at, history_text, BlocksOutcome::Failed)
                        .await?;
                    return Ok(Some(BlocksOutcome::Failed));
                }
                // The chain is closed unless it was left open; either way the entry fails.
                if !matches!(e, DaycareError::ChainLeftOpen { .. })
                    && let Err(close) = self
                        .close_remaining_blocks(blocks, index, assistant_at, history_text, BlocksOutcome::Failed)
                        .await
                {
                    warn!(agent_id = %self.id, error = %close, "failed to settle remaining blocks");
                }
                Err(e)
            }
        }
    }

    /// Settle the blocks after `index`, which will not run. Tool-call blocks get
    /// a "not executed" result, so every native call has an answer. After a
    /// failure, tag blocks are cut from the assistant text.
    async fn close_remaining_blocks(
        &self,
        blocks: &[ScriptBlock],
        index: usize,
        assistant_at: Millis,
        history_text: &str,
        outcome: BlocksOutcome,
    ) -> Result<()> {
        let Some(stopped) = blocks.get(index) else {
            return Ok(());
        };
        if stopped.tool_call_id.is_none() {
            if outcome == BlocksOutcome::Failed
                && let Some(text) = failure_trim(history_text, index)
            {
                self.append(HistoryRecord::AssistantRewrite {
                    at: now_millis(),
                    assistant_at,
                    text,
                    reason: FAILURE_TRIM_REASON.to_string(),
                })
                .await?;
            }
            return Ok(());
        }
        let content = match outcome {
            BlocksOutcome::Skipped => NOT_EXECUTED_SKIPPED,
            BlocksOutcome::Steered => NOT_EXECUTED_STEERED,
            BlocksOutcome::Failed | BlocksOutcome::Completed => NOT_EXECUTED_FAILED,
        };
        for skipped in &blocks[index + 1..] {
            if let Some(id) = &skipped.tool_call_id {
                self.append(HistoryRecord::ToolResult {
                    at: now_millis(),
                    tool_call_id: id.clone(),
                    content: content.to_string(),
                    is_error: true,
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Finish what the previous process left half done, then let the model
    /// continue the turn. Does nothing when history shows no pending phase.
    pub(crate) async fn recover(&self, context: &ToolExecutionContext) -> Result<InboxResult> {
        self.set_state(LoopState::Recovering);
        let history = self.deps.history.read_all(&self.id).await?;
        let Some(phase) = resolve_pending_phase(&history) else {
            debug!(agent_id = %self.id, "nothing to recover");
            return Ok(InboxResult::default());
        };
        info!(agent_id = %self.id, phase = phase.kind(), "recovering pending phase");
        self.deps.events.publish(Event::AgentRestored {
            agent_id: self.id.clone(),
            phase: phase.kind().to_string(),
        });

        let preamble = preamble_build(&self.deps.tools.list_tools());
        let outcome = match phase {
            PendingPhase::RecoveryError {
                start,
                message,
                blocks,
                block_index,
                assistant_at,
                history_text,
            } => {
                self.append(error_complete_record(&start.tool_call_id, &message, vec![], 0))
                    .await?;
                self.close_remaining_blocks(
                    &blocks,
                    block_index,
                    assistant_at,
                    &history_text,
                    BlocksOutcome::Failed,
                )
                .await?;
                self.append_note(format!("RLM execution failed after restart. {message}"))
                    .await?;
                BlocksOutcome::Failed
            }
            PendingPhase::ScriptStart {
                blocks,
                block_index,
                assistant_at,
                history_text,
            } => {
                self.run_blocks(&blocks, block_index, assistant_at, &history_text, &preamble, context)
                    .await?
            }
            PendingPhase::ToolCall {
                start,
                snapshot,
                blocks,
                block_index,
                assistant_at,
                history_text,
            } => {
                self.set_state(LoopState::ExecutingBlocks(block_index));
                let hooks = self.rlm_hooks();
                let restored = self
                    .deps
                    .executor
                    .restore(&snapshot, &start, self.deps.tools.as_ref(), context, &hooks)
                    .await;
                let note = restore_note(&restored);
                let settled = self
                    .settle_block(
                        &blocks,
                        block_index,
                        assistant_at,
                        &history_text,
                        &start.tool_call_id,
                        restored,
                    )
                    .await?;
                self.append_note(note).await?;
                match settled {
                    Some(outcome) => outcome,
                    None => {
                        self.run_blocks(
                            &blocks,
                            block_index + 1,
                            assistant_at,
                            &history_text,
                            &preamble,
                            context,
                        )
                        .await?
                    }
                }
            }
        };

        if outcome == BlocksOutcome::Skipped {
            return Ok(InboxResult {
                response_text: None,
                skipped: true,
            });
        }
        self.run_turn(context).await
    }

    /// Record a failed model call where the model and the user will see it.
    async fn inference_failed(&self, error: DaycareError) -> DaycareError {
        let text = match &error {
            DaycareError::NoProviderAvailable => "No inference provider available.",
            _ => "Inference failed.",
        };
        warn!(agent_id = %self.id, error = %error, "inference failed, ending turn");
        if let Err(e) = self.append_note(text.to_string()).await {
            warn!(agent_id = %self.id, error = %e, "failed to record inference failure");
        }
        error
    }

    fn rlm_hooks(&self) -> RlmHooks {
        let history = Arc::clone(&self.deps.history);
        let events = self.deps.events.clone();
        let agent_id = self.id.clone();
        let checkpoint: CheckpointFn = Arc::new(move |record: HistoryRecord| {
            let history = Arc::clone(&history);
            let events = events.clone();
            let agent_id = agent_id.clone();
            async move {
                history.append(&agent_id, &record).await?;
                if let HistoryRecord::RlmToolCall(call) = &record {
                    events.publish(Event::ScriptToolCall {
                        agent_id: agent_id.clone(),
                        tool_call_id: call.tool_call_id.clone(),
                        function_name: call.function_name.clone(),
                    });
                }
                Ok::<(), DaycareError>(())
            }
            .boxed()
        });

        let inbox = Arc::clone(&self.inbox);
        let steering: SteeringFn = Arc::new(move || {
            inbox.consume_steering().map(|s| SteeringInterrupt {
                text: s.text,
                origin: s.origin,
            })
        });

        RlmHooks {
            checkpoint: Some(checkpoint),
            steering: Some(steering),
        }
    }

    fn route_options(&self) -> RouteOptions {
        let (agent_id, events) = (self.id.clone(), self.deps.events.clone());
        let on_attempt: AttemptHook = Box::new(move |settings: &ProviderSettings, model: &str| {
            info!(agent_id = %agent_id, provider = %settings.id, model, "inference attempt");
            events.publish(Event::InferenceAttempt {
                agent_id: agent_id.clone(),
                provider: settings.id.clone(),
                model: model.to_string(),
            });
        });

        let (agent_id, events) = (self.id.clone(), self.deps.events.clone());
        let on_fallback: FallbackHook = Box::new(move |settings: &ProviderSettings, error: &DaycareError| {
            warn!(agent_id = %agent_id, provider = %settings.id, error = %error, "inference fallback");
            events.publish(Event::InferenceFallback {
                agent_id: agent_id.clone(),
                provider: settings.id.clone(),
                reason: error.to_string(),
            });
        });

        let (agent_id, events) = (self.id.clone(), self.deps.events.clone());
        let on_success: SuccessHook = Box::new(move |settings: &ProviderSettings, _response: &InferenceResponse| {
            info!(agent_id = %agent_id, provider = %settings.id, model = %settings.model, "inference succeeded");
            events.publish(Event::InferenceCompleted {
                agent_id: agent_id.clone(),
                provider: settings.id.clone(),
                model: settings.model.clone(),
            });
        });

        let agent_id = self.id.clone();
        let on_failure: FailureHook = Box::new(move |settings: &ProviderSettings, error: &DaycareError| {
            warn!(agent_id = %agent_id, provider = %settings.id, model = %settings.model, error = %error, "inference failed");
        });

        RouteOptions {
            providers_override: self.options.providers_override.clone(),
            session_id: Some(self.id.clone()),
            stop: vec![RUN_PYTHON_CLOSE.to_string()],
            on_attempt: Some(on_attempt),
            on_fallback: Some(on_fallback),
            on_success: Some(on_success),
            on_failure: Some(on_failure),
        }
    }

    pub(crate) async fn append(&self, record: HistoryRecord) -> Result<()> {
        self.deps.history.append(&self.id, &record).await
    }

    async fn append_note(&self, text: String) -> Result<()> {
        self.append(HistoryRecord::Note {
            at: now_millis(),
            text,
        })
        .await
    }
}

fn restore_note(restored: &Result<RlmExecuteResult>) -> String {
    match restored {
        Ok(result) if result.output.is_empty() => {
            "RLM execution completed after restart. Output: (empty)".to_string()
        }
        Ok(result) => format!("RLM execution completed after restart. Output: {}", result.output),
        Err(e) => format!("RLM execution failed after restart. {}", e.script_message()),
    }
}
