//! In-memory pacing line for single-process operation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::PacingLine;
use crate::error::Result;

/// Last-grant timestamp under a mutex. Safe across concurrent callers in
/// one process; state is not persisted across restarts.
pub struct MemoryLine {
    last_grant: Mutex<Option<Instant>>,
}

impl MemoryLine {
    pub fn new() -> Self {
        Self {
            last_grant: Mutex::new(None),
        }
    }
}

impl Default for MemoryLine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PacingLine for MemoryLine {
    async fn try_claim(&self, min_interval: Duration) -> Result<Option<Duration>> {
        let mut last = self.last_grant.lock().await;
        let now = Instant::now();
        match *last {
            Some(prev) => {
                let elapsed = now.duration_since(prev);
                if elapsed >= min_interval {
                    *last = Some(now);
                    Ok(None)
                } else {
                    Ok(Some(min_interval - elapsed))
                }
            }
            None => {
                *last = Some(now);
                Ok(None)
            }
        }
    }
}
