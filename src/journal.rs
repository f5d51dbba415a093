use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::info;

use crate::error::ProctorResult;

/// A submission that could not be delivered and waits to be re-sent.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub id: i64,
    pub test_id: String,
    pub payload: serde_json::Value,
    pub failure: String,
    pub recorded_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Local outbox of failed submissions
#[derive(Debug)]
pub struct SubmissionJournal {
    conn: Connection,
}

impl SubmissionJournal {
    pub fn open<P: AsRef<Path>>(path: P) -> ProctorResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> ProctorResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> ProctorResult<Self> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS pending_submissions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                test_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                failure TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 1,
                sent_at TEXT
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pending_submissions_sent ON pending_submissions(sent_at)",
            [],
        )?;
        Ok(Self { conn })
    }

    /// Stores a payload the server did not accept. Returns the entry id.
    pub fn record(
        &self,
        test_id: &str,
        payload: &serde_json::Value,
        failure: &str,
        now: DateTime<Utc>,
    ) -> ProctorResult<i64> {
        self.conn.execute(
            r#"
            INSERT INTO pending_submissions (test_id, payload, failure, recorded_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![test_id, serde_json::to_string(payload)?, failure, now.to_rfc3339()],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(id, test_id, "submission journaled");
        Ok(id)
    }

    /// Oldest first.
    pub fn pending(&self) -> ProctorResult<Vec<JournalEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, test_id, payload, failure, recorded_at, attempts
            FROM pending_submissions
            WHERE sent_at IS NULL
            ORDER BY id ASC
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, test_id, payload, failure, recorded_at, attempts) = row?;
            let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
                .map_err(|_| {
                    rusqlite::Error::InvalidColumnType(
                        4,
                        "recorded_at".to_string(),
                        rusqlite::types::Type::Text,
                    )
                })?
                .with_timezone(&Utc);
            entries.push(JournalEntry {
                id,
                test_id,
                payload: serde_json::from_str(&payload)?,
                failure,
                recorded_at,
                attempts,
            });
        }
        Ok(entries)
    }

    pub fn mark_sent(&self, id: i64, now: DateTime<Utc>) -> ProctorResult<()> {
        self.conn.execute(
            "UPDATE pending_submissions SET sent_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Notes another failed delivery of an existing entry.
    pub fn mark_failed(&self, id: i64, failure: &str) -> ProctorResult<()> {
        self.conn.execute(
            "UPDATE pending_submissions SET attempts = attempts + 1, failure = ?1 WHERE id = ?2",
            params![failure, id],
        )?;
        Ok(())
    }
}
