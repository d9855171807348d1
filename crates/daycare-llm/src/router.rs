use daycare_core::{DaycareError, ProviderSettings, Result};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::provider::{CompletionOptions, InferenceContext, InferenceResponse};
use crate::registry::ProviderRegistry;

/// Called before a completion is attempted: `(provider settings, model id)`.
pub type AttemptHook = Box<dyn Fn(&ProviderSettings, &str) + Send + Sync>;
/// Called when a provider is skipped and the router moves on.
pub type FallbackHook = Box<dyn Fn(&ProviderSettings, &DaycareError) + Send + Sync>;
/// Called after a successful completion.
pub type SuccessHook = Box<dyn Fn(&ProviderSettings, &InferenceResponse) + Send + Sync>;
/// Called when a completion call itself fails. The router stops right after.
pub type FailureHook = Box<dyn Fn(&ProviderSettings, &DaycareError) + Send + Sync>;

/// Options for one routed completion.
#[derive(Default)]
pub struct RouteOptions {
    /// Use this provider list instead of the configured one.
    pub providers_override: Option<Vec<ProviderSettings>>,
    pub session_id: Option<String>,
    pub stop: Vec<String>,
    pub on_attempt: Option<AttemptHook>,
    pub on_fallback: Option<FallbackHook>,
    pub on_success: Option<SuccessHook>,
    pub on_failure: Option<FailureHook>,
}

/// Which provider answered, and with what.
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub response: InferenceResponse,
    pub provider_id: String,
    pub model_id: String,
}

/// Routes completions through the configured providers in priority order.
///
/// A provider that is not registered, or whose client cannot be built, is skipped.
/// A provider whose completion call fails ends the attempt: the error is returned
/// without trying the rest of the list.
pub struct InferenceRouter {
    registry: Arc<ProviderRegistry>,
    providers: RwLock<Vec<ProviderSettings>>,
    read_lock: Option<Arc<tokio::sync::RwLock<()>>>,
}

impl InferenceRouter {
    pub fn new(registry: Arc<ProviderRegistry>, providers: Vec<ProviderSettings>) -> Self {
        Self {
            registry,
            providers: RwLock::new(providers),
            read_lock: None,
        }
    }

    /// Hold `lock` in shared mode for the whole duration of every completion.
    /// Configuration reloads take it exclusively.
    pub fn with_read_lock(mut self, lock: Arc<tokio::sync::RwLock<()>>) -> Self {
        self.read_lock = Some(lock);
        self
    }

    /// Replace the configured provider list.
    pub fn reload(&self, providers: Vec<ProviderSettings>) {
        let ids: Vec<&str> = providers.iter().map(|p| p.id.as_str()).collect();
        info!(providers = ?ids, "inference providers reloaded");
        *self.providers.write() = providers;
    }

    pub fn providers(&self) -> Vec<ProviderSettings> {
        self.providers.read().clone()
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Run `fut` under the router's read lock, if one is configured.
    pub async fn run_with_read_lock<F: Future>(&self, fut: F) -> F::Output {
        match &self.read_lock {
            Some(lock) => {
                let _guard = lock.read().await;
                fut.await
            }
            None => fut.await,
        }
    }

    /// Complete `context` with the first provider that can serve it.
    pub async fn complete(
        &self,
        context: &InferenceContext,
        agent_id: &str,
        options: RouteOptions,
    ) -> Result<InferenceResult> {
        self.run_with_read_lock(self.complete_unlocked(context, agent_id, options))
            .await
    }

    async fn complete_unlocked(
        &self,
        context: &InferenceContext,
        agent_id: &str,
        options: RouteOptions,
    ) -> Result<InferenceResult> {
        let providers = match &options.providers_override {
            Some(list) => list.clone(),
            None => self.providers.read().clone(),
        };
        let call_options = CompletionOptions {
            session_id: options.session_id.clone(),
            stop: options.stop.clone(),
        };

        let mut last_error: Option<DaycareError> = None;

        for settings in &providers {
            let Some(provider) = self.registry.get(&settings.id) else {
                warn!(agent_id, provider = %settings.id, "provider not registered, skipping");
                if let Some(hook) = &options.on_fallback {
                    hook(
                        settings,
                        &DaycareError::ProviderUnavailable {
                            provider: settings.id.clone(),
                            reason: "not registered".into(),
                        },
                    );
                }
                continue;
            };

            let client = match provider.create_client(&settings.model, &settings.options).await {
                Ok(client) => client,
                Err(e) => {
                    warn!(agent_id, provider = %settings.id, error = %e, "failed to create client, falling back");
                    if let Some(hook) = &options.on_fallback {
                        hook(settings, &e);
                    }
                    last_error = Some(DaycareError::ProviderUnavailable {
                        provider: settings.id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let model_id = client.model_id().to_string();
            if let Some(hook) = &options.on_attempt {
                hook(settings, &model_id);
            }
            debug!(agent_id, provider = %settings.id, model = %model_id, "inference attempt");

            match client.complete(context, &call_options).await {
                Ok(response) => {
                    if let Some(hook) = &options.on_success {
                        hook(settings, &response);
                    }
                    return Ok(InferenceResult {
                        response,
                        provider_id: settings.id.clone(),
                        model_id,
                    });
                }
                Err(e) => {
                    warn!(agent_id, provider = %settings.id, model = %model_id, error = %e, "inference failed");
                    if let Some(hook) = &options.on_failure {
                        hook(settings, &e);
                    }
                    return Err(match e {
                        DaycareError::ModelCall { .. } => e,
                        other => DaycareError::ModelCall {
                            provider: settings.id.clone(),
                            reason: other.to_string(),
                        },
                    });
                }
            }
        }

        Err(last_error.unwrap_or(DaycareError::NoProviderAvailable))
    }
}
