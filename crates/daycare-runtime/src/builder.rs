//! Wiring the runtime from `daycare.toml`.

use daycare_config::ConfigLoader;
use daycare_core::{EventBus, ToolResolver};
use daycare_history::{HistoryStore, InboxStore};
use daycare_llm::{InferenceRouter, ProviderRegistry};
use daycare_rlm::{ProcessWorkerFactory, RlmExecutor, RlmWorkers, WorkerFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::agent::AgentDeps;
use crate::context::HistoryContextBuilder;

impl AgentDeps {
    /// Build the runtime from the loader's current configuration. Scripts run in
    /// `[rlm] worker_command` subprocesses; completions hold the loader's reload
    /// lock, so a reload never lands half-way through one.
    pub fn from_config(
        loader: &ConfigLoader,
        registry: Arc<ProviderRegistry>,
        tools: Arc<dyn ToolResolver>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let config = loader.get();
        let factory = ProcessWorkerFactory::new(config.rlm.worker_command.clone(), config.rlm.worker_args.clone())
            .with_stop_grace(Duration::from_millis(config.rlm.stop_grace_ms));
        Self::from_config_with_workers(loader, Arc::new(factory), registry, tools, history)
    }

    /// Like [`AgentDeps::from_config`], with workers from `factory`.
    pub fn from_config_with_workers(
        loader: &ConfigLoader,
        factory: Arc<dyn WorkerFactory>,
        registry: Arc<ProviderRegistry>,
        tools: Arc<dyn ToolResolver>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let config = loader.get();
        let workers = RlmWorkers::new(factory)
            .with_request_timeout(Duration::from_secs(config.rlm.request_timeout_secs));
        let router = InferenceRouter::new(registry, config.providers.clone())
            .with_read_lock(loader.reload_lock());
        info!(
            providers = config.providers.len(),
            worker = %config.rlm.worker_command,
            "agent runtime configured"
        );

        Self {
            history,
            inbox_store: None,
            router: Arc::new(router),
            tools,
            executor: Arc::new(RlmExecutor::new(Arc::new(workers), config.rlm.limits)),
            context_builder: Arc::new(HistoryContextBuilder::new(config.agent.system_prompt.clone())),
            events: EventBus::new(config.agent.event_capacity),
        }
    }

    pub fn with_inbox_store(mut self, store: Arc<dyn InboxStore>) -> Self {
        self.inbox_store = Some(store);
        self
    }
}

/// Keep `router`'s provider list in step with the loader. The task ends when
/// the loader and its file watcher are gone.
pub fn follow_config_reloads(loader: &ConfigLoader, router: Arc<InferenceRouter>) -> JoinHandle<()> {
    let mut versions = loader.subscribe();
    let config = loader.shared();
    tokio::spawn(async move {
        while versions.changed().await.is_ok() {
            let providers = config.read().providers.clone();
            router.reload(providers);
        }
        debug!("configuration source closed, provider reloads stopped");
    })
}
