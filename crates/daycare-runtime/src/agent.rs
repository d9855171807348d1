use daycare_config::AgentConfig;
use daycare_core::{
    AgentId, DaycareError, Event, EventBus, HistoryRecord, ProviderSettings, Result,
    ToolExecutionContext, ToolResolver, now_millis,
};
use daycare_history::{HistoryStore, InboxStore, PersistedInboxEntry};
use daycare_llm::InferenceRouter;
use daycare_rlm::RlmExecutor;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{Mutex as TokioMutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent_loop::LoopState;
use crate::context::ContextBuilder;
use crate::inbox::{
    AgentInbox, InboxEntry, InboxItem, InboxOutcome, InboxResult, PostOptions, QueuedEntry,
    Steering,
};

/// Everything an agent talks to. Shared freely between agents.
#[derive(Clone)]
pub struct AgentDeps {
    pub history: Arc<dyn HistoryStore>,
    /// Durable copy of the inbox. Without one, queued work dies with the process.
    pub inbox_store: Option<Arc<dyn InboxStore>>,
    pub router: Arc<InferenceRouter>,
    pub tools: Arc<dyn ToolResolver>,
    pub executor: Arc<RlmExecutor>,
    pub context_builder: Arc<dyn ContextBuilder>,
    pub events: EventBus,
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Model calls allowed per turn.
    pub max_iterations: usize,
    /// Tool-execution source used when an entry does not name one.
    pub source: String,
    /// Use these providers instead of the router's configured list.
    pub providers_override: Option<Vec<ProviderSettings>>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            source: "daycare".into(),
            providers_override: None,
        }
    }
}

impl From<&AgentConfig> for AgentOptions {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            source: config.source.clone(),
            providers_override: None,
        }
    }
}

/// State shared between an [`Agent`] handle and its loop task.
pub(crate) struct AgentShared {
    pub(crate) id: AgentId,
    pub(crate) deps: AgentDeps,
    pub(crate) options: AgentOptions,
    pub(crate) inbox: Arc<AgentInbox>,
    state: watch::Sender<LoopState>,
    /// Held across queue-and-persist and across delete-after-handling, so a
    /// finished entry can never be saved again behind its own delete.
    post_lock: TokioMutex<()>,
}

/// One agent: an inbox and the single task that works through it.
pub struct Agent {
    shared: Arc<AgentShared>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(id: impl Into<AgentId>, deps: AgentDeps, options: AgentOptions) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            shared: Arc::new(AgentShared {
                id: id.into(),
                deps,
                options,
                inbox: Arc::new(AgentInbox::new()),
                state,
                post_lock: TokioMutex::new(()),
            }),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn inbox(&self) -> &Arc<AgentInbox> {
        &self.shared.inbox
    }

    pub fn state(&self) -> LoopState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LoopState> {
        self.shared.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Queue `item` and persist it. The receiver resolves once the entry has
    /// been handled, with the outcome shared by every post merged into it.
    pub async fn post(&self, item: InboxItem, options: PostOptions) -> oneshot::Receiver<InboxOutcome> {
        let (tx, rx) = oneshot::channel();
        let _guard = self.shared.post_lock.lock().await;
        let queued = self.shared.inbox.post(item, Some(tx), options);
        debug!(
            agent_id = %self.shared.id,
            entry_id = %queued.id,
            kind = queued.item.kind(),
            pending = self.shared.inbox.size(),
            "inbox entry posted"
        );
        if let Err(e) = self.shared.persist(&queued).await {
            error!(agent_id = %self.shared.id, entry_id = %queued.id, error = %e, "failed to persist inbox entry");
        }
        rx
    }

    /// Post `item` and wait for it to be handled.
    pub async fn post_and_wait(&self, item: InboxItem) -> InboxOutcome {
        self.post(item, PostOptions::default())
            .await
            .await
            .unwrap_or_else(|_| {
                Err(Arc::new(DaycareError::Agent(
                    "agent stopped before handling the entry".into(),
                )))
            })
    }

    /// Ask the running script to stop at its next checkpoint. Replaces any
    /// steering request that has not been picked up yet.
    pub fn steer(&self, steering: Steering) {
        debug!(agent_id = %self.shared.id, "steering requested");
        self.shared.inbox.steer(steering);
    }

    /// Start the loop: recovery first, then stored entries, then new posts.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(DaycareError::Agent(format!(
                "agent {} is already running",
                self.shared.id
            )));
        }
        self.shared.inbox.attach();
        self.shared
            .inbox
            .post(InboxItem::Restore, None, PostOptions::front());
        if let Err(e) = self.shared.replay().await {
            self.shared.inbox.detach();
            return Err(e);
        }

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move { shared.run_loop().await });
        *self.task.lock() = Some(handle);
        info!(agent_id = %self.shared.id, "agent started");
        Ok(())
    }

    /// Stop after the entry in progress. Queued entries stay in the inbox store
    /// and are replayed by the next start.
    pub async fn stop(&self) {
        self.shared.inbox.detach();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(agent_id = %self.shared.id, error = %e, "agent loop ended abnormally");
        }
        info!(agent_id = %self.shared.id, "agent stopped");
    }
}

impl AgentShared {
    pub(crate) fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            self.set_state(LoopState::AwaitingInboxEntry);
            let Some(entry) = self.inbox.next().await else {
                break;
            };
            if self.handle_entry(entry).await.is_break() {
                self.inbox.detach();
                break;
            }
            self.set_state(LoopState::Idle);
        }
        self.set_state(LoopState::Idle);
        debug!(agent_id = %self.id, "agent loop finished");
    }

    /// Handle one entry. `Break` when history can no longer be trusted to
    /// describe the agent and the loop must stop.
    async fn handle_entry(&self, entry: InboxEntry) -> ControlFlow<()> {
        let kind = entry.item.kind();
        debug!(agent_id = %self.id, entry_id = %entry.id, kind, "handling inbox entry");
        if !matches!(entry.item, InboxItem::Restore) {
            self.mark_in_flight(&entry.id).await;
        }

        let handled = self.handle_item(entry.item.clone()).await;
        let halt = matches!(handled, Err(DaycareError::ChainLeftOpen { .. }));
        let outcome: InboxOutcome = match handled {
            Ok(result) => {
                if !matches!(entry.item, InboxItem::Restore | InboxItem::Reset { .. }) {
                    self.deps.events.publish(Event::TurnCompleted {
                        agent_id: self.id.clone(),
                    });
                }
                Ok(result)
            }
            Err(e) => {
                error!(agent_id = %self.id, entry_id = %entry.id, kind, error = %e, "inbox entry failed");
                self.deps.events.publish(Event::AgentError {
                    agent_id: self.id.clone(),
                    error: e.to_string(),
                });
                Err(Arc::new(e))
            }
        };

        self.set_state(LoopState::Persisting);
        if halt {
            // The stored entry stays flagged; the next start recovers the open chain.
            error!(agent_id = %self.id, entry_id = %entry.id, "script chain left open, stopping agent loop");
            entry.complete(outcome);
            return ControlFlow::Break(());
        }
        if !matches!(entry.item, InboxItem::Restore) {
            self.forget(&entry.id).await;
        }
        entry.complete(outcome);
        ControlFlow::Continue(())
    }

    async fn handle_item(&self, item: InboxItem) -> Result<InboxResult> {
        match item {
            InboxItem::Message {
                text,
                files,
                context,
            } => {
                self.append(HistoryRecord::UserMessage {
                    at: now_millis(),
                    text,
                    files,
                    message_id: context.message_id.clone(),
                })
                .await?;
                let tool_context = self.execution_context(context.message_id, context.source);
                self.run_turn(&tool_context).await
            }
            InboxItem::SystemMessage { text, origin } => {
                self.append(HistoryRecord::UserMessage {
                    at: now_millis(),
                    text: system_message_text(&text, origin.as_deref()),
                    files: vec![],
                    message_id: None,
                })
                .await?;
                let tool_context = self.execution_context(None, origin);
                self.run_turn(&tool_context).await
            }
            InboxItem::Reset { message } => {
                self.append(HistoryRecord::Reset {
                    at: now_millis(),
                    message,
                })
                .await?;
                info!(agent_id = %self.id, "conversation reset");
                Ok(InboxResult::default())
            }
            InboxItem::Restore => {
                let tool_context = self.execution_context(None, None);
                self.recover(&tool_context).await
            }
        }
    }

    fn execution_context(&self, message_id: Option<String>, source: Option<String>) -> ToolExecutionContext {
        ToolExecutionContext {
            agent_id: self.id.clone(),
            source: source.unwrap_or_else(|| self.options.source.clone()),
            message_id,
            python_execution: false,
        }
    }

    async fn persist(&self, queued: &QueuedEntry) -> Result<()> {
        let Some(store) = &self.deps.inbox_store else {
            return Ok(());
        };
        if matches!(queued.item, InboxItem::Restore) {
            return Ok(());
        }
        let entry = PersistedInboxEntry {
            id: queued.id.clone(),
            posted_at: queued.posted_at,
            mergeable: queued.mergeable,
            in_flight: false,
            item: serde_json::to_value(&queued.item)?,
        };
        store.save(&self.id, &entry).await
    }

    async fn mark_in_flight(&self, entry_id: &str) {
        let Some(store) = &self.deps.inbox_store else {
            return;
        };
        // Behind the post lock, so the flag lands after the entry's own save.
        let _guard = self.post_lock.lock().await;
        if let Err(e) = store.mark_in_flight(&self.id, entry_id).await {
            warn!(agent_id = %self.id, entry_id, error = %e, "failed to flag inbox entry in flight");
        }
    }

    async fn forget(&self, entry_id: &str) {
        let Some(store) = &self.deps.inbox_store else {
            return;
        };
        let _guard = self.post_lock.lock().await;
        if let Err(e) = store.delete(&self.id, entry_id).await {
            error!(agent_id = %self.id, entry_id, error = %e, "failed to delete handled inbox entry");
        }
    }

    /// Queue the stored entries of a previous run.
    ///
    /// A row flagged in flight was being handled when that run ended. What it
    /// left half done is in history and recovery finishes it, so the row is
    /// dropped rather than replayed. Rows still queued in memory (a stop and
    /// start within one process) are not queued twice.
    async fn replay(&self) -> Result<()> {
        let Some(store) = &self.deps.inbox_store else {
            return Ok(());
        };
        let rows = store.list(&self.id).await?;
        if rows.is_empty() {
            return Ok(());
        }
        let queued: HashSet<String> = self.inbox.list_pending().into_iter().map(|e| e.id).collect();

        for row in rows {
            if row.in_flight {
                store.delete(&self.id, &row.id).await?;
                info!(agent_id = %self.id, entry_id = %row.id, "dropped in-flight inbox entry taken over by recovery");
                continue;
            }
            if queued.contains(&row.id) {
                continue;
            }
            match serde_json::from_value::<InboxItem>(row.item) {
                Ok(item) => {
                    self.inbox
                        .post(item, None, PostOptions::replay(row.id, row.posted_at));
                }
                Err(e) => {
                    warn!(agent_id = %self.id, entry_id = %row.id, error = %e, "dropping unreadable inbox entry");
                    store.delete(&self.id, &row.id).await?;
                }
            }
        }
        info!(agent_id = %self.id, pending = self.inbox.size(), "inbox replayed");
        Ok(())
    }
}

/// User-turn text for a message that came from the system rather than a person.
pub fn system_message_text(text: &str, origin: Option<&str>) -> String {
    match origin {
        Some(origin) => format!("<system_message origin=\"{origin}\">\n{text}\n</system_message>"),
        None => format!("<system_message>\n{text}\n</system_message>"),
    }
}
