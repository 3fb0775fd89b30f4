//! Connection-pooled transactional persistence.
//!
//! All writes go through [`Store::with_retry`], which re-runs an
//! operation a bounded number of times when SQLite reports write
//! contention and surfaces `StoreBusy` (transient to callers) after
//! exhaustion. Batch upserts update the owning session's counters in the
//! same transaction.

mod metrics;
mod pool;
mod posts;
mod schema;
mod sessions;
mod users;

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{Result, ScrapeError};

pub use metrics::MetricsSummary;
pub use pool::{ConnectionPool, PooledConnection, PoolStats};
pub use posts::{PostFilter, PostPage};
pub use sessions::SessionFilter;

/// Posts/users per batch commit.
pub const DEFAULT_BATCH_SIZE: usize = 100;

const WRITE_RETRIES: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseStats {
    pub posts: u64,
    pub users: u64,
    pub sessions: u64,
    pub metrics: u64,
    pub distinct_subreddits: u64,
    pub file_size_bytes: u64,
    pub pool: PoolStats,
}

#[derive(Clone)]
pub struct Store {
    pool: ConnectionPool,
}

impl Store {
    /// Open the store file, initializing schema on first use.
    pub async fn open(path: &Path, max_connections: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ScrapeError::Fatal(format!("store directory: {e}")))?;
            }
        }
        let store = Self {
            pool: ConnectionPool::new(path, max_connections),
        };
        let conn = store.pool.get().await?;
        schema::init_schema(&conn)?;
        Ok(store)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Run `op` against a leased connection, retrying on write
    /// contention with jittered exponential backoff.
    ///
    /// rusqlite is synchronous, so the connection work runs on the
    /// blocking pool; only the lease wait and the retry sleeps touch
    /// the async runtime.
    pub(crate) async fn with_retry<T, F>(&self, mut op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut(&mut PooledConnection) -> Result<T> + Send + 'static,
    {
        let mut attempt = 0u32;
        loop {
            let conn = self.pool.get().await?;
            let (result, op_back) = tokio::task::spawn_blocking(move || {
                let mut op = op;
                let mut conn = conn;
                let result = op(&mut conn);
                // Return the lease from the blocking thread too.
                drop(conn);
                (result, op)
            })
            .await
            .map_err(|e| ScrapeError::Fatal(format!("store worker panicked: {e}")))?;
            op = op_back;

            match result {
                Err(ScrapeError::StoreBusy) if attempt < WRITE_RETRIES => {
                    let base = RETRY_BASE.as_millis() as u64 * 2u64.pow(attempt);
                    let jitter = rand::thread_rng().gen_range(0..=base / 2 + 1);
                    let delay = Duration::from_millis(base + jitter);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "store busy, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Aggregate row counts and sizes for the stats endpoint.
    pub async fn database_stats(&self) -> Result<DatabaseStats> {
        let file_size_bytes = std::fs::metadata(self.pool.path())
            .map(|m| m.len())
            .unwrap_or(0);
        let pool = self.pool.stats();
        self.with_retry(move |conn| {
            let count = |sql: &str| -> Result<u64> {
                Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as u64)
            };
            Ok(DatabaseStats {
                posts: count("SELECT COUNT(*) FROM posts")?,
                users: count("SELECT COUNT(*) FROM users")?,
                sessions: count("SELECT COUNT(*) FROM sessions")?,
                metrics: count("SELECT COUNT(*) FROM metrics")?,
                distinct_subreddits: count("SELECT COUNT(DISTINCT subreddit) FROM posts")?,
                file_size_bytes,
                pool: pool.clone(),
            })
        })
        .await
    }

    /// Age-based retention: prune posts, users, and metrics older than
    /// the cutoff.
    pub async fn gc(&self, before: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        let cutoff = before.to_rfc3339();
        self.with_retry(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0u64;
            removed += tx.execute(
                "DELETE FROM post_by_session WHERE post_id IN
                    (SELECT id FROM posts WHERE scraped_at < ?1)",
                [&cutoff],
            )? as u64;
            removed += tx.execute("DELETE FROM posts WHERE scraped_at < ?1", [&cutoff])? as u64;
            removed += tx.execute("DELETE FROM users WHERE scraped_at < ?1", [&cutoff])? as u64;
            removed += tx.execute("DELETE FROM metrics WHERE ts < ?1", [&cutoff])? as u64;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::scratch_store;

    #[tokio::test]
    async fn open_initializes_schema() {
        let (store, _dir) = scratch_store().await;
        let stats = store.database_stats().await.unwrap();
        assert_eq!(stats.posts, 0);
        assert_eq!(stats.sessions, 0);
        assert!(stats.file_size_bytes > 0);
    }
}
