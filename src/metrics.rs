//! Buffered metric recording.
//!
//! Samples are pushed onto a bounded channel and flushed to the store by
//! a background task every few seconds or every 500 samples, whichever
//! comes first. Recording never blocks the hot path; when the buffer is
//! full the sample is dropped.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::{Event, EventBus};
use crate::models::MetricSample;
use crate::store::Store;

const BUFFER: usize = 2048;
const FLUSH_EVERY: usize = 500;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct MetricsSink {
    tx: mpsc::Sender<MetricSample>,
}

impl MetricsSink {
    /// Start the flusher task and return the sink handle.
    pub fn start(store: Store, bus: EventBus) -> Self {
        let (tx, rx) = mpsc::channel(BUFFER);
        tokio::spawn(flusher(store, bus, rx));
        Self { tx }
    }

    /// Queue a sample; lossy under pressure.
    pub fn record(&self, sample: MetricSample) {
        if self.tx.try_send(sample).is_err() {
            debug!("metrics buffer full, sample dropped");
        }
    }
}

async fn flusher(store: Store, bus: EventBus, mut rx: mpsc::Receiver<MetricSample>) {
    let mut pending: Vec<MetricSample> = Vec::with_capacity(FLUSH_EVERY);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            sample = rx.recv() => {
                match sample {
                    Some(sample) => {
                        bus.publish(Event::Metric {
                            operation: sample.operation.clone(),
                            duration_ms: sample.duration_ms,
                            ok: sample.ok,
                            ts: sample.ts_start,
                        });
                        pending.push(sample);
                        if pending.len() >= FLUSH_EVERY {
                            flush(&store, &mut pending).await;
                        }
                    }
                    None => {
                        flush(&store, &mut pending).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                flush(&store, &mut pending).await;
            }
        }
    }
}

async fn flush(store: &Store, pending: &mut Vec<MetricSample>) {
    if pending.is_empty() {
        return;
    }
    if let Err(e) = store.record_metrics(pending).await {
        warn!("metric flush failed: {e}");
    }
    pending.clear();
}
