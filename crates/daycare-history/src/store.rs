use async_trait::async_trait;
use daycare_core::{HistoryRecord, Millis, Result, now_millis};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::view::{find_user_message, history_view};

/// Ordered, append-only history per agent.
///
/// `append` must be durable before it returns: the script engine relies on a
/// checkpoint being on disk before the tool it describes runs.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, agent_id: &str, record: &HistoryRecord) -> Result<()>;

    /// Every record ever appended, markers included, in insertion order.
    async fn read_raw(&self, agent_id: &str) -> Result<Vec<HistoryRecord>>;

    /// The effective history: markers folded in.
    async fn read_all(&self, agent_id: &str) -> Result<Vec<HistoryRecord>> {
        Ok(history_view(&self.read_raw(agent_id).await?))
    }

    /// Hide every record after the user message `message_id`.
    ///
    /// Returns how many records were hidden; 0 when the message is unknown or
    /// already last, in which case nothing is written.
    async fn truncate_after(
        &self,
        agent_id: &str,
        message_id: &str,
        reason: Option<&str>,
    ) -> Result<usize> {
        if message_id.is_empty() {
            return Ok(0);
        }
        let view = self.read_all(agent_id).await?;
        let Some(pos) = find_user_message(&view, message_id) else {
            return Ok(0);
        };
        let deleted_count = view.len() - pos - 1;
        if deleted_count == 0 {
            return Ok(0);
        }
        self.append(
            agent_id,
            &HistoryRecord::HistoryTruncate {
                at: now_millis(),
                message_id: message_id.to_string(),
                deleted_count,
                reason: reason.map(str::to_string),
            },
        )
        .await?;
        info!(agent_id, message_id, deleted_count, "history truncated");
        Ok(deleted_count)
    }

    /// Blank the text of the user message `message_id`. Returns whether it existed.
    async fn redact(&self, agent_id: &str, message_id: &str) -> Result<bool> {
        if message_id.is_empty() {
            return Ok(false);
        }
        let view = self.read_all(agent_id).await?;
        if find_user_message(&view, message_id).is_none() {
            return Ok(false);
        }
        self.append(
            agent_id,
            &HistoryRecord::MessageRedact {
                at: now_millis(),
                message_id: message_id.to_string(),
            },
        )
        .await?;
        info!(agent_id, message_id, "message redacted");
        Ok(true)
    }
}

/// An inbox entry as stored between `post` and the end of its handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedInboxEntry {
    pub id: String,
    pub posted_at: Millis,
    /// Whether later messages may still merge into this entry.
    pub mergeable: bool,
    /// Set when the agent began handling the entry.
    #[serde(default)]
    pub in_flight: bool,
    /// The serialized inbox item.
    pub item: Value,
}

/// Durable copy of each agent's pending inbox.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Insert or replace the entry with the same id.
    async fn save(&self, agent_id: &str, entry: &PersistedInboxEntry) -> Result<()>;

    /// Flag the entry as being handled. No-op for an unknown id.
    async fn mark_in_flight(&self, agent_id: &str, entry_id: &str) -> Result<()>;

    async fn delete(&self, agent_id: &str, entry_id: &str) -> Result<()>;

    /// Pending entries ordered by `posted_at`, then insertion order.
    async fn list(&self, agent_id: &str) -> Result<Vec<PersistedInboxEntry>>;
}
