//! Leased connection pool over the SQLite store file.
//!
//! Each connection is configured for reader/writer overlap (WAL) with a
//! 30 s busy wait. Leases are bounded by a semaphore; returning a lease
//! puts the connection back on the idle list, and a periodic trim keeps
//! the idle list from hoarding file handles.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, ScrapeError};

/// Per-connection busy wait, milliseconds.
const BUSY_TIMEOUT_MS: u32 = 30_000;

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_connections: usize,
    pub idle: usize,
    pub in_use: usize,
    pub reused: u64,
    pub created: u64,
}

struct PoolInner {
    path: PathBuf,
    limit: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    max_connections: usize,
    reused: AtomicU64,
    created: AtomicU64,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(path: &Path, max_connections: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                path: path.to_path_buf(),
                limit: Arc::new(Semaphore::new(max_connections)),
                idle: Mutex::new(Vec::new()),
                max_connections,
                reused: AtomicU64::new(0),
                created: AtomicU64::new(0),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Lease a connection; waits when all leases are out.
    pub async fn get(&self) -> Result<PooledConnection> {
        let permit = self
            .inner
            .limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ScrapeError::Fatal("connection pool closed".into()))?;

        let pooled = self.inner.idle.lock().unwrap().pop();
        let conn = match pooled {
            Some(conn) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                conn
            }
            None => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                open_connection(&self.inner.path)?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            inner: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Close surplus idle connections, keeping at most `keep`.
    pub fn trim_idle(&self, keep: usize) {
        let mut idle = self.inner.idle.lock().unwrap();
        while idle.len() > keep {
            idle.pop();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.inner.idle.lock().unwrap().len();
        let available = self.inner.limit.available_permits();
        PoolStats {
            max_connections: self.inner.max_connections,
            idle,
            in_use: self.inner.max_connections - available,
            reused: self.inner.reused.load(Ordering::Relaxed),
            created: self.inner.created.load(Ordering::Relaxed),
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| ScrapeError::Fatal(format!("store unreachable at {}: {e}", path.display())))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;
    conn.pragma_update(None, "cache_size", 10_000)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(conn)
}

/// RAII connection lease; returns to the idle list on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("lease holds a connection")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("lease holds a connection")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.inner.idle.lock().unwrap().push(conn);
        }
    }
}
