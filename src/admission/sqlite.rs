//! SQLite-backed pacing line for multi-process coordination.
//!
//! The last-grant timestamp lives in a table inside the shared store
//! file, claimed under an IMMEDIATE transaction so every worker process
//! observes one pacing line. rusqlite is synchronous, so each claim
//! runs on the blocking pool rather than an async worker thread.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, TransactionBehavior};

use super::PacingLine;
use crate::error::{Result, ScrapeError};

pub struct SqliteLine {
    conn: Arc<Mutex<Connection>>,
    key: String,
}

impl SqliteLine {
    /// Open (or create) the pacing table in the given database file.
    pub fn open(path: &Path, key: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ScrapeError::Fatal(format!("admission line unavailable: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 30_000)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS admission_line (
                key TEXT PRIMARY KEY,
                last_grant_ms INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl PacingLine for SqliteLine {
    async fn try_claim(&self, min_interval: Duration) -> Result<Option<Duration>> {
        let conn = Arc::clone(&self.conn);
        let key = self.key.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let interval_ms = min_interval.as_millis() as i64;
            let now_ms = chrono::Utc::now().timestamp_millis();

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let last: Option<i64> = tx
                .query_row(
                    "SELECT last_grant_ms FROM admission_line WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            match last {
                Some(prev) if now_ms - prev < interval_ms => {
                    tx.commit()?;
                    let wait_ms = (interval_ms - (now_ms - prev)).max(1) as u64;
                    Ok(Some(Duration::from_millis(wait_ms)))
                }
                _ => {
                    tx.execute(
                        "INSERT INTO admission_line (key, last_grant_ms) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET last_grant_ms = excluded.last_grant_ms",
                        params![key, now_ms],
                    )?;
                    tx.commit()?;
                    Ok(None)
                }
            }
        })
        .await
        .map_err(|e| ScrapeError::Fatal(format!("admission worker panicked: {e}")))?
    }
}
