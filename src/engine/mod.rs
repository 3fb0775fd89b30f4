//! Durable session lifecycle.
//!
//! The engine is the single owner of session mutation: it creates rows,
//! drives `queued -> running -> terminal` transitions, re-materializes
//! interrupted sessions at boot, and watches heartbeats. Every
//! transition is persisted (guarded by the expected prior state, so a
//! terminal row can never move again) before its event is published,
//! which makes the store the source of truth and restarts resumable.

mod scheduler;

pub use scheduler::PlanOutcome;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::ForumClient;
use crate::enrich::ContentEnricher;
use crate::error::{Result, ScrapeError};
use crate::events::{Event, EventBus};
use crate::metrics::MetricsSink;
use crate::models::{Session, SessionOptions, SessionStatus, SessionView};
use crate::store::{SessionFilter, Store};

/// States a session may leave on its way to a terminal one.
const ACTIVE_STATES: &[SessionStatus] = &[
    SessionStatus::Queued,
    SessionStatus::Running,
    SessionStatus::Stopping,
];

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Grace period for workers to drain after a stop request.
    pub drain_timeout: Duration,
    /// Idle heartbeat cadence; the watchdog cutoff is three ticks.
    pub heartbeat_interval: Duration,
    /// Minimum spacing between progress publishes per session.
    pub progress_coalesce: Duration,
    pub worker_backoff_base: Duration,
    pub worker_backoff_cap: Duration,
    pub worker_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            progress_coalesce: Duration::from_millis(250),
            worker_backoff_base: Duration::from_secs(1),
            worker_backoff_cap: Duration::from_secs(30),
            worker_retries: 5,
        }
    }
}

/// Listing filter accepted by [`SessionEngine::list`].
#[derive(Debug, Clone, Default)]
pub struct SessionListFilter {
    pub status: Option<SessionStatus>,
    pub limit: u32,
}

struct ActiveSession {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct SessionEngine {
    store: Store,
    bus: EventBus,
    client: Arc<ForumClient>,
    enricher: Arc<ContentEnricher>,
    metrics: MetricsSink,
    config: EngineConfig,
    active: Mutex<HashMap<Uuid, ActiveSession>>,
}

impl SessionEngine {
    pub fn new(
        store: Store,
        bus: EventBus,
        client: Arc<ForumClient>,
        enricher: Arc<ContentEnricher>,
        metrics: MetricsSink,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            client,
            enricher,
            metrics,
            config,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create and launch a session. The session row is persisted before
    /// this returns; scraping proceeds asynchronously.
    pub async fn start(
        self: &Arc<Self>,
        subreddits: Vec<String>,
        posts_per_subreddit: u32,
        options: SessionOptions,
    ) -> Result<Uuid> {
        let mut seen = std::collections::HashSet::new();
        let subreddits: Vec<String> = subreddits
            .into_iter()
            .map(|s| s.trim().trim_start_matches("r/").to_string())
            .filter(|s| !s.is_empty() && seen.insert(s.to_lowercase()))
            .collect();
        if subreddits.is_empty() {
            return Err(ScrapeError::Permanent(
                "validation: at least one subreddit is required".into(),
            ));
        }
        if options.max_workers == 0 {
            return Err(ScrapeError::Permanent(
                "validation: max_workers must be at least 1".into(),
            ));
        }

        let session = Session::new(subreddits, posts_per_subreddit, options);
        let id = session.session_id;
        self.store.create_session(&session).await?;
        self.spawn_session(session);
        Ok(id)
    }

    /// Request a stop. Idempotent: terminal sessions come back as-is.
    /// Returns `None` for unknown ids.
    pub async fn stop(self: &Arc<Self>, session_id: Uuid) -> Result<Option<SessionView>> {
        let Some(session) = self.store.get_session(session_id).await? else {
            return Ok(None);
        };
        if session.status.is_terminal() {
            return Ok(Some(session.view()));
        }

        let moved = self
            .store
            .transition_session(
                session_id,
                SessionStatus::Stopping,
                &[SessionStatus::Queued, SessionStatus::Running],
                None,
                None,
            )
            .await?;
        if moved {
            self.publish_status(session_id, SessionStatus::Stopping);

            let signalled = {
                let active = self.active.lock().unwrap();
                match active.get(&session_id) {
                    Some(handle) => handle.stop_tx.send(true).is_ok(),
                    None => false,
                }
            };

            if signalled {
                // Enforce the drain window: if the run task has not
                // finalized by then, cut it down and finalize here.
                let engine = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(engine.config.drain_timeout).await;
                    engine.force_cancel(session_id, "drain timeout").await;
                });
            } else {
                // No live task (e.g. found mid-stop after a restart);
                // nothing to drain.
                self.finalize_cancelled(session_id, "stopped with no active worker")
                    .await;
            }
        }

        Ok(self.store.get_session(session_id).await?.map(|s| s.view()))
    }

    /// Restart a failed session under its original plan. Progress resets
    /// to zero; committed posts are skipped via the upsert contract.
    pub async fn resume(self: &Arc<Self>, session_id: Uuid) -> Result<Option<SessionView>> {
        let Some(mut session) = self.store.get_session(session_id).await? else {
            return Ok(None);
        };
        let moved = self
            .store
            .transition_session(
                session_id,
                SessionStatus::Queued,
                &[SessionStatus::Failed],
                None,
                None,
            )
            .await?;
        if !moved {
            return Err(ScrapeError::Permanent(format!(
                "validation: only failed sessions can resume (status is {})",
                session.status.as_str()
            )));
        }
        self.store.reset_session_progress(session_id).await?;
        session.status = SessionStatus::Queued;
        self.spawn_session(session);
        Ok(self.store.get_session(session_id).await?.map(|s| s.view()))
    }

    pub async fn status(&self, session_id: Uuid) -> Result<Option<SessionView>> {
        Ok(self
            .store
            .get_session(session_id)
            .await?
            .map(|s| s.view()))
    }

    pub async fn list(&self, filter: SessionListFilter) -> Result<Vec<SessionView>> {
        let sessions = self
            .store
            .list_sessions(&SessionFilter {
                status: filter.status,
                limit: filter.limit,
            })
            .await?;
        Ok(sessions.into_iter().map(|s| s.view()).collect())
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Re-materialize interrupted sessions at boot.
    ///
    /// `running` rows are demoted to `queued` (their heartbeat died with
    /// the process) and restarted with the original plan and persisted
    /// counters; `stopping` rows finalize as cancelled since the stop
    /// was already requested.
    pub async fn resume_active(self: &Arc<Self>) -> Result<usize> {
        let sessions = self.store.load_active_sessions().await?;
        let mut restarted = 0;
        for mut session in sessions {
            match session.status {
                SessionStatus::Stopping => {
                    self.finalize_cancelled(session.session_id, "stop requested before restart")
                        .await;
                }
                SessionStatus::Running | SessionStatus::Queued => {
                    if session.status == SessionStatus::Running {
                        self.store
                            .transition_session(
                                session.session_id,
                                SessionStatus::Queued,
                                &[SessionStatus::Running],
                                None,
                                None,
                            )
                            .await?;
                        session.status = SessionStatus::Queued;
                    }
                    info!(session = %session.session_id, "restoring session");
                    self.spawn_session(session);
                    restarted += 1;
                }
                _ => {}
            }
        }
        Ok(restarted)
    }

    /// Watchdog loop: fail running sessions whose heartbeat went stale.
    pub async fn run_watchdog(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now()
                - chrono::Duration::from_std(interval * 3).unwrap_or(chrono::Duration::seconds(15));
            let stale = match self.store.stale_running_sessions(cutoff).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("watchdog scan failed: {e}");
                    continue;
                }
            };
            for session_id in stale {
                let moved = self
                    .store
                    .transition_session(
                        session_id,
                        SessionStatus::Failed,
                        &[SessionStatus::Running],
                        Some("heartbeat timeout"),
                        Some(Utc::now()),
                    )
                    .await
                    .unwrap_or(false);
                if !moved {
                    continue;
                }
                warn!(session = %session_id, "heartbeat timeout");
                if let Some(handle) = self.active.lock().unwrap().remove(&session_id) {
                    handle.task.abort();
                }
                self.bus.publish(Event::SessionFailed {
                    session_id,
                    error: "heartbeat timeout".into(),
                    ts: Utc::now(),
                });
            }
        }
    }

    fn spawn_session(self: &Arc<Self>, session: Session) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let engine = self.clone();
        let session_id = session.session_id;
        let task = tokio::spawn(async move {
            engine.run_session(session, stop_rx).await;
        });
        self.active
            .lock()
            .unwrap()
            .insert(session_id, ActiveSession { stop_tx, task });
    }

    async fn run_session(self: Arc<Self>, session: Session, stop_rx: watch::Receiver<bool>) {
        let session_id = session.session_id;

        let started = self
            .store
            .transition_session(
                session_id,
                SessionStatus::Running,
                &[SessionStatus::Queued],
                None,
                None,
            )
            .await
            .unwrap_or(false);
        if !started {
            // Stopped (or otherwise moved) before the first fetch.
            if let Ok(Some(current)) = self.store.get_session(session_id).await {
                if current.status == SessionStatus::Stopping {
                    self.finalize_cancelled(session_id, "stopped before start").await;
                }
            }
            self.active.lock().unwrap().remove(&session_id);
            return;
        }
        self.bus.publish(Event::SessionStarted {
            session_id,
            subreddits: session.subreddits.clone(),
            ts: Utc::now(),
        });

        // Idle heartbeat: batch commits also refresh it, this tick keeps
        // long admission waits from looking dead.
        let heartbeat = {
            let store = self.store.clone();
            let interval = self.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let _ = store.touch_heartbeat(session_id).await;
                }
            })
        };

        let initial_observed = self
            .store
            .observed_counts(session_id)
            .await
            .unwrap_or_default();

        let outcome = scheduler::run_plan(
            &session,
            initial_observed,
            self.store.clone(),
            self.client.clone(),
            self.enricher.clone(),
            self.bus.clone(),
            self.metrics.clone(),
            self.config.clone(),
            stop_rx,
        )
        .await;

        heartbeat.abort();

        // Settle the final progress value from the store's own counts;
        // this also covers zero-target plans, which complete at 100
        // without a single batch commit.
        let observed = self
            .store
            .observed_counts(session_id)
            .await
            .unwrap_or_default();
        let final_progress = Session::compute_progress(&session.plan, &observed);
        let _ = self
            .store
            .update_session_progress(session_id, final_progress)
            .await;

        self.finalize(session_id, outcome).await;
        self.active.lock().unwrap().remove(&session_id);
    }

    async fn finalize(&self, session_id: Uuid, outcome: PlanOutcome) {
        let now = Utc::now();
        match outcome {
            PlanOutcome::Completed => {
                let moved = self
                    .store
                    .transition_session(
                        session_id,
                        SessionStatus::Completed,
                        &[SessionStatus::Running, SessionStatus::Stopping],
                        None,
                        Some(now),
                    )
                    .await
                    .unwrap_or(false);
                if !moved {
                    return;
                }
                let (posts, users) = match self.store.get_session(session_id).await {
                    Ok(Some(s)) => (s.posts_scraped, s.users_scraped),
                    _ => (0, 0),
                };
                info!(session = %session_id, posts, "session completed");
                self.bus.publish(Event::SessionCompleted {
                    session_id,
                    posts_scraped: posts,
                    users_scraped: users,
                    ts: now,
                });
            }
            PlanOutcome::Cancelled => {
                self.finalize_cancelled(session_id, "stopped by request").await;
            }
            PlanOutcome::Failed(message) => {
                let moved = self
                    .store
                    .transition_session(
                        session_id,
                        SessionStatus::Failed,
                        ACTIVE_STATES,
                        Some(&message),
                        Some(now),
                    )
                    .await
                    .unwrap_or(false);
                if !moved {
                    return;
                }
                warn!(session = %session_id, error = %message, "session failed");
                self.bus.publish(Event::SessionFailed {
                    session_id,
                    error: message,
                    ts: now,
                });
            }
        }
    }

    async fn finalize_cancelled(&self, session_id: Uuid, reason: &str) {
        let moved = self
            .store
            .transition_session(
                session_id,
                SessionStatus::Cancelled,
                ACTIVE_STATES,
                Some(reason),
                Some(Utc::now()),
            )
            .await
            .unwrap_or(false);
        if !moved {
            return;
        }
        info!(session = %session_id, reason, "session cancelled");
        self.publish_status(session_id, SessionStatus::Cancelled);
    }

    /// Drain-window enforcement: if the run task outlived the grace
    /// period after a stop, cut it down and finalize.
    async fn force_cancel(self: &Arc<Self>, session_id: Uuid, reason: &str) {
        let handle = self.active.lock().unwrap().remove(&session_id);
        let Some(handle) = handle else {
            return; // Run task already finalized.
        };
        handle.task.abort();
        self.finalize_cancelled(session_id, reason).await;
    }

    fn publish_status(&self, session_id: Uuid, status: SessionStatus) {
        self.bus.publish(Event::StatusUpdate {
            session_id,
            status: status.as_str().to_string(),
            ts: Utc::now(),
        });
    }
}
