use async_trait::async_trait;
use daycare_core::{DaycareError, HistoryRecord, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::store::{HistoryStore, InboxStore, PersistedInboxEntry};

fn db_err(e: rusqlite::Error) -> DaycareError {
    DaycareError::History(e.to_string())
}

/// SQLite-backed history and inbox.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the history database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening history store");

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL for concurrent readers; FULL sync so an append survives power loss.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(db_err)?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                at INTEGER NOT NULL,
                kind TEXT NOT NULL,
                record TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_agent ON history(agent_id, seq);

            CREATE TABLE IF NOT EXISTS inbox (
                agent_id TEXT NOT NULL,
                id TEXT NOT NULL,
                posted_at INTEGER NOT NULL,
                mergeable INTEGER NOT NULL,
                in_flight INTEGER NOT NULL DEFAULT 0,
                item TEXT NOT NULL,
                PRIMARY KEY (agent_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_inbox_agent ON inbox(agent_id, posted_at);
            ",
        )
        .map_err(db_err)?;

        // Databases created before the in-flight flag existed.
        let has_in_flight: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('inbox') WHERE name = 'in_flight'",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if !has_in_flight {
            conn.execute_batch("ALTER TABLE inbox ADD COLUMN in_flight INTEGER NOT NULL DEFAULT 0;")
                .map_err(db_err)?;
        }

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// Agents that have any history, sorted by id.
    pub fn agent_ids(&self) -> Result<Vec<String>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare("SELECT DISTINCT agent_id FROM history ORDER BY agent_id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn append(&self, agent_id: &str, record: &HistoryRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let db = self.db.lock();
        db.execute(
            "INSERT INTO history (agent_id, at, kind, record) VALUES (?1, ?2, ?3, ?4)",
            params![agent_id, record.at(), record.kind(), json],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn read_raw(&self, agent_id: &str) -> Result<Vec<HistoryRecord>> {
        let rows: Vec<(i64, String)> = {
            let db = self.db.lock();
            let mut stmt = db
                .prepare("SELECT seq, record FROM history WHERE agent_id = ?1 ORDER BY seq")
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![agent_id], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows
        };

        let mut records = Vec::with_capacity(rows.len());
        for (seq, json) in rows {
            match serde_json::from_str::<HistoryRecord>(&json) {
                Ok(record) => records.push(record),
                // One unreadable row must not make the whole agent unloadable.
                Err(e) => warn!(agent_id, seq, error = %e, "skipping unreadable history record"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl InboxStore for SqliteStore {
    async fn save(&self, agent_id: &str, entry: &PersistedInboxEntry) -> Result<()> {
        let item = serde_json::to_string(&entry.item)?;
        let db = self.db.lock();
        db.execute(
            "INSERT INTO inbox (agent_id, id, posted_at, mergeable, in_flight, item)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(agent_id, id) DO UPDATE SET
                posted_at = excluded.posted_at,
                mergeable = excluded.mergeable,
                in_flight = excluded.in_flight,
                item = excluded.item",
            params![agent_id, entry.id, entry.posted_at, entry.mergeable, entry.in_flight, item],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_in_flight(&self, agent_id: &str, entry_id: &str) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "UPDATE inbox SET in_flight = 1 WHERE agent_id = ?1 AND id = ?2",
            params![agent_id, entry_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, agent_id: &str, entry_id: &str) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "DELETE FROM inbox WHERE agent_id = ?1 AND id = ?2",
            params![agent_id, entry_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn list(&self, agent_id: &str) -> Result<Vec<PersistedInboxEntry>> {
        let rows: Vec<(String, i64, bool, bool, String)> = {
            let db = self.db.lock();
            let mut stmt = db
                .prepare(
                    "SELECT id, posted_at, mergeable, in_flight, item FROM inbox
                     WHERE agent_id = ?1 ORDER BY posted_at, rowid",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![agent_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows
        };

        let mut entries = Vec::with_capacity(rows.len());
        for (id, posted_at, mergeable, in_flight, item) in rows {
            match serde_json::from_str(&item) {
                Ok(item) => entries.push(PersistedInboxEntry {
                    id,
                    posted_at,
                    mergeable,
                    in_flight,
                    item,
                }),
                Err(e) => warn!(agent_id, entry_id = %id, error = %e, "skipping unreadable inbox row"),
            }
        }
        Ok(entries)
    }
}
