//! # daycare-history
//!
//! Durable storage for agents:
//!
//! - **History**: one append-only, ordered record log per agent. Truncation and
//!   redaction append marker records; [`history_view`] folds them into the
//!   effective history that readers see.
//! - **Inbox**: inbound work persisted before it is queued and deleted once
//!   handled, so a crash neither loses nor duplicates it.
//!
//! Backends: SQLite (crash-durable) and in-memory (tests, embedding).

pub mod memory;
pub mod sqlite;
pub mod store;
pub mod view;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{HistoryStore, InboxStore, PersistedInboxEntry};
pub use view::{REDACTED_TEXT, history_view};
