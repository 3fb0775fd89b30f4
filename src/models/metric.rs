//! Append-only performance metric samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One timing sample for a named operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub operation: String,
    pub ts_start: DateTime<Utc>,
    pub duration_ms: u64,
    pub ok: bool,
    pub memory_delta: i64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl MetricSample {
    pub fn new(operation: impl Into<String>, ts_start: DateTime<Utc>, duration_ms: u64, ok: bool) -> Self {
        Self {
            operation: operation.into(),
            ts_start,
            duration_ms,
            ok,
            memory_delta: 0,
            tags: HashMap::new(),
        }
    }

    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }
}
