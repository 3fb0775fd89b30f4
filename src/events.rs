//! Non-blocking event fan-out.
//!
//! One publisher, many subscribers, each with its own bounded queue. A
//! publish never waits: when a subscriber's queue is full the event is
//! dropped for that subscriber alone and its drop counter incremented.
//! A stalled or disconnected client therefore cannot slow sessions or
//! other clients. Per-session ordering is preserved because each
//! subscriber queue is FIFO and the engine publishes from one task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Queue length per subscriber.
pub const SUBSCRIBER_QUEUE: usize = 64;

/// Event kinds a subscriber can opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    Progress,
    SessionCompleted,
    SessionFailed,
    StatusUpdate,
    StoreWrite,
    Metric,
}

/// A frame pushed to live subscribers. Serialized with a `type`
/// discriminator for the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SessionStarted {
        session_id: Uuid,
        subreddits: Vec<String>,
        ts: DateTime<Utc>,
    },
    Progress {
        session_id: Uuid,
        progress: f64,
        posts_scraped: u64,
        ts: DateTime<Utc>,
    },
    SessionCompleted {
        session_id: Uuid,
        posts_scraped: u64,
        users_scraped: u64,
        ts: DateTime<Utc>,
    },
    SessionFailed {
        session_id: Uuid,
        error: String,
        ts: DateTime<Utc>,
    },
    StatusUpdate {
        session_id: Uuid,
        status: String,
        ts: DateTime<Utc>,
    },
    StoreWrite {
        session_id: Uuid,
        posts: u64,
        users: u64,
        ts: DateTime<Utc>,
    },
    Metric {
        operation: String,
        duration_ms: u64,
        ok: bool,
        ts: DateTime<Utc>,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SessionStarted { .. } => EventKind::SessionStarted,
            Event::Progress { .. } => EventKind::Progress,
            Event::SessionCompleted { .. } => EventKind::SessionCompleted,
            Event::SessionFailed { .. } => EventKind::SessionFailed,
            Event::StatusUpdate { .. } => EventKind::StatusUpdate,
            Event::StoreWrite { .. } => EventKind::StoreWrite,
            Event::Metric { .. } => EventKind::Metric,
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            Event::SessionStarted { session_id, .. }
            | Event::Progress { session_id, .. }
            | Event::SessionCompleted { session_id, .. }
            | Event::SessionFailed { session_id, .. }
            | Event::StatusUpdate { session_id, .. }
            | Event::StoreWrite { session_id, .. } => Some(*session_id),
            Event::Metric { .. } => None,
        }
    }
}

struct Subscriber {
    tx: mpsc::Sender<Event>,
    /// `None` means all kinds.
    kinds: Option<Vec<EventKind>>,
    drops: Arc<AtomicU64>,
}

struct BusInner {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

/// Handle owned by a subscriber; dropping the receiver unsubscribes on
/// the next publish.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
    pub drops: Arc<AtomicU64>,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a subscriber, optionally filtered to certain kinds.
    pub fn subscribe(&self, kinds: Option<Vec<EventKind>>) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let drops = Arc::new(AtomicU64::new(0));
        self.inner.subscribers.lock().unwrap().insert(
            id,
            Subscriber {
                tx,
                kinds,
                drops: drops.clone(),
            },
        );
        Subscription { id, rx, drops }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.subscribers.lock().unwrap().remove(&id);
    }

    /// Fan an event out to every interested subscriber without waiting.
    pub fn publish(&self, event: Event) {
        let mut closed = Vec::new();
        {
            let subscribers = self.inner.subscribers.lock().unwrap();
            for (id, sub) in subscribers.iter() {
                if let Some(kinds) = &sub.kinds {
                    if !kinds.contains(&event.kind()) {
                        continue;
                    }
                }
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        sub.drops.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            let mut subscribers = self.inner.subscribers.lock().unwrap();
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    /// Per-subscriber drop counters, for the stats surface.
    pub fn drop_counts(&self) -> HashMap<u64, u64> {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, sub)| (*id, sub.drops.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
