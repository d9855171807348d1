use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::provider::InferenceProvider;

/// Provider implementations currently available, keyed by id.
///
/// Plugins register and unregister providers at runtime, so the router looks
/// them up on every call instead of caching.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn InferenceProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any previous one with the same id.
    pub fn register(&self, provider: Arc<dyn InferenceProvider>) {
        let id = provider.id().to_string();
        info!(provider = %id, "registered inference provider");
        self.providers.write().insert(id, provider);
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<dyn InferenceProvider>> {
        let removed = self.providers.write().remove(id);
        if removed.is_some() {
            info!(provider = %id, "unregistered inference provider");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn InferenceProvider>> {
        self.providers.read().get(id).cloned()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
