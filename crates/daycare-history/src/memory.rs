use async_trait::async_trait;
use daycare_core::{HistoryRecord, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::store::{HistoryStore, InboxStore, PersistedInboxEntry};

/// Process-local store. Nothing survives a restart; meant for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    history: Mutex<HashMap<String, Vec<HistoryRecord>>>,
    inbox: Mutex<HashMap<String, Vec<PersistedInboxEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append(&self, agent_id: &str, record: &HistoryRecord) -> Result<()> {
        self.history
            .lock()
            .entry(agent_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn read_raw(&self, agent_id: &str) -> Result<Vec<HistoryRecord>> {
        Ok(self.history.lock().get(agent_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl InboxStore for MemoryStore {
    async fn save(&self, agent_id: &str, entry: &PersistedInboxEntry) -> Result<()> {
        let mut inbox = self.inbox.lock();
        let entries = inbox.entry(agent_id.to_string()).or_default();
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry.clone(),
            None => entries.push(entry.clone()),
        }
        Ok(())
    }

    async fn mark_in_flight(&self, agent_id: &str, entry_id: &str) -> Result<()> {
        if let Some(entry) = self
            .inbox
            .lock()
            .get_mut(agent_id)
            .and_then(|entries| entries.iter_mut().find(|e| e.id == entry_id))
        {
            entry.in_flight = true;
        }
        Ok(())
    }

    async fn delete(&self, agent_id: &str, entry_id: &str) -> Result<()> {
        if let Some(entries) = self.inbox.lock().get_mut(agent_id) {
            entries.retain(|e| e.id != entry_id);
        }
        Ok(())
    }

    async fn list(&self, agent_id: &str) -> Result<Vec<PersistedInboxEntry>> {
        let mut entries = self.inbox.lock().get(agent_id).cloned().unwrap_or_default();
        // Stable sort keeps insertion order among equal timestamps.
        entries.sort_by_key(|e| e.posted_at);
        Ok(entries)
    }
}
