//! Metric sample persistence.

use rusqlite::params;

use super::Store;
use crate::error::Result;
use crate::models::MetricSample;

/// Aggregate view over recent samples, per operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub operation: String,
    pub samples: u64,
    pub failures: u64,
    pub avg_duration_ms: f64,
}

impl Store {
    /// Append a batch of samples in one transaction.
    pub async fn record_metrics(&self, samples: &[MetricSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let samples = samples.to_vec();
        self.with_retry(move |conn| {
            let tx = conn.transaction()?;
            for sample in &samples {
                tx.execute(
                    "INSERT INTO metrics (ts, operation, duration_ms, ok, memory_delta, tags)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        sample.ts_start.to_rfc3339(),
                        sample.operation,
                        sample.duration_ms as i64,
                        sample.ok,
                        sample.memory_delta,
                        serde_json::to_string(&sample.tags).unwrap_or_else(|_| "{}".into()),
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Per-operation aggregates across all stored samples.
    pub async fn metrics_summary(&self) -> Result<Vec<MetricsSummary>> {
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT operation, COUNT(*),
                        SUM(CASE WHEN ok = 0 THEN 1 ELSE 0 END),
                        AVG(duration_ms)
                 FROM metrics GROUP BY operation ORDER BY operation",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(MetricsSummary {
                        operation: row.get(0)?,
                        samples: row.get::<_, i64>(1)? as u64,
                        failures: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
                        avg_duration_ms: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}
