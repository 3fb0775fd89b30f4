//! Error taxonomy shared across the scraping runtime.
//!
//! The split matters operationally: workers retry `Transient` failures,
//! skip past `Permanent` ones, and only the session engine may turn any
//! of them into a failed session.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ScrapeError>;

#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Retryable at the caller level: HTTP timeout/5xx/429 after client
    /// retries are exhausted, or a busy store.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Not retryable: 404/403, auth misconfiguration, schema violation.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Item-level malformed data; the batch continues without the item.
    #[error("skipped item: {0}")]
    Skipped(String),

    /// Caller-initiated stop or deadline.
    #[error("cancelled")]
    Cancelled,

    /// The circuit protecting an endpoint is open; callers back off for
    /// `retry_after` without consuming admission or retry budget.
    #[error("circuit open for {endpoint}")]
    CircuitOpen {
        endpoint: String,
        retry_after: Duration,
    },

    /// Write contention on the store survived all retries. Treated as
    /// `Transient` by callers.
    #[error("store busy")]
    StoreBusy,

    /// Broken invariant or unreachable dependency at init; propagates to
    /// process shutdown.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ScrapeError {
    /// Whether a worker may retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScrapeError::Transient(_) | ScrapeError::StoreBusy | ScrapeError::CircuitOpen { .. }
        )
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ScrapeError::Permanent(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScrapeError::Cancelled)
    }
}

impl From<rusqlite::Error> for ScrapeError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                ScrapeError::StoreBusy
            }
            _ => ScrapeError::Fatal(format!("store error: {e}")),
        }
    }
}

impl From<serde_json::Error> for ScrapeError {
    fn from(e: serde_json::Error) -> Self {
        ScrapeError::Skipped(format!("malformed record: {e}"))
    }
}
