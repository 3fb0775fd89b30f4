//! Plan execution across a worker pool.
//!
//! Workers pull plan entries from a shared queue and run the fetch ->
//! filter -> enrich -> commit loop, all sharing one admission token per
//! domain and one circuit. Errors are isolated per worker: transient
//! failures burn a bounded per-entry retry budget, permanent ones skip
//! to the next entry, and only budget exhaustion or a stuck-open circuit
//! fails the whole session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analytics;
use crate::client::{ForumClient, MAX_PAGE_SIZE};
use crate::enrich::ContentEnricher;
use crate::error::ScrapeError;
use crate::events::{Event, EventBus};
use crate::metrics::MetricsSink;
use crate::models::{MetricSample, PlanEntry, Post, Session, SessionOptions, User};
use crate::store::Store;

use super::EngineConfig;

/// How a plan run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Everything a worker needs, shared across the pool.
pub(super) struct PlanShared {
    pub session_id: Uuid,
    pub options: SessionOptions,
    pub plan: Vec<PlanEntry>,
    pub store: Store,
    pub client: Arc<ForumClient>,
    pub enricher: Arc<ContentEnricher>,
    pub bus: EventBus,
    pub metrics: MetricsSink,
    pub config: EngineConfig,
    queue: Mutex<VecDeque<PlanEntry>>,
    observed: Mutex<HashMap<String, u64>>,
    /// First session-fatal error wins.
    failure: Mutex<Option<String>>,
    /// When this session first saw the forum circuit open; cleared by
    /// the next successful fetch. Bounds the per-session downtime.
    circuit_blocked_since: Mutex<Option<Instant>>,
    last_publish: Mutex<Instant>,
    seen_urls: tokio::sync::Mutex<HashSet<String>>,
    seen_users: tokio::sync::Mutex<HashSet<String>>,
}

impl PlanShared {
    fn observed_pairs(&self) -> Vec<(String, u64)> {
        self.observed
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    fn fail(&self, message: String) {
        let mut failure = self.failure.lock().unwrap();
        if failure.is_none() {
            *failure = Some(message);
        }
    }

    fn failed(&self) -> bool {
        self.failure.lock().unwrap().is_some()
    }
}

/// Fan the session's plan across workers and drain it.
pub(super) async fn run_plan(
    session: &Session,
    initial_observed: Vec<(String, u64)>,
    store: Store,
    client: Arc<ForumClient>,
    enricher: Arc<ContentEnricher>,
    bus: EventBus,
    metrics: MetricsSink,
    config: EngineConfig,
    stop_rx: watch::Receiver<bool>,
) -> PlanOutcome {
    let observed: HashMap<String, u64> = initial_observed.into_iter().collect();

    // Entries already satisfied by a previous run are not re-queued.
    let queue: VecDeque<PlanEntry> = session
        .plan
        .iter()
        .filter(|e| {
            e.target_count > 0
                && observed.get(&e.subreddit).copied().unwrap_or(0) < e.target_count as u64
        })
        .cloned()
        .collect();

    if queue.is_empty() {
        return PlanOutcome::Completed;
    }

    let worker_count = if session.options.parallel {
        (session.options.max_workers as usize).min(queue.len()).max(1)
    } else {
        1
    };

    let shared = Arc::new(PlanShared {
        session_id: session.session_id,
        options: session.options.clone(),
        plan: session.plan.clone(),
        store,
        client,
        enricher,
        bus,
        metrics,
        config,
        queue: Mutex::new(queue),
        observed: Mutex::new(observed),
        failure: Mutex::new(None),
        circuit_blocked_since: Mutex::new(None),
        last_publish: Mutex::new(Instant::now() - std::time::Duration::from_secs(60)),
        seen_urls: tokio::sync::Mutex::new(HashSet::new()),
        seen_users: tokio::sync::Mutex::new(HashSet::new()),
    });

    info!(
        session = %session.session_id,
        workers = worker_count,
        entries = shared.queue.lock().unwrap().len(),
        "scheduling plan"
    );

    let mut handles = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let shared = shared.clone();
        let stop_rx = stop_rx.clone();
        handles.push(tokio::spawn(worker_loop(worker_id, shared, stop_rx)));
    }

    let mut stopped = false;
    for handle in handles {
        match handle.await {
            Ok(WorkerExit::Stopped) => stopped = true,
            Ok(WorkerExit::Done) => {}
            Err(e) => {
                warn!("worker panicked: {e}");
                shared.fail(format!("worker panicked: {e}"));
            }
        }
    }

    // Flush the final progress value regardless of outcome.
    publish_progress(&shared, true).await;

    if let Some(message) = shared.failure.lock().unwrap().clone() {
        return PlanOutcome::Failed(message);
    }
    if stopped || *stop_rx.borrow() {
        return PlanOutcome::Cancelled;
    }
    PlanOutcome::Completed
}

enum WorkerExit {
    Done,
    Stopped,
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<PlanShared>,
    stop_rx: watch::Receiver<bool>,
) -> WorkerExit {
    loop {
        if *stop_rx.borrow() {
            return WorkerExit::Stopped;
        }
        if shared.failed() {
            return WorkerExit::Done;
        }
        let entry = shared.queue.lock().unwrap().pop_front();
        let Some(entry) = entry else {
            return WorkerExit::Done;
        };
        debug!(worker_id, subreddit = %entry.subreddit, "picked plan entry");
        match run_entry(&shared, &entry, &stop_rx).await {
            EntryExit::Done => {}
            EntryExit::Stopped => return WorkerExit::Stopped,
            EntryExit::SessionFailed => return WorkerExit::Done,
        }
    }
}

enum EntryExit {
    Done,
    Stopped,
    SessionFailed,
}

/// Sleep that doubles as a stop signal observation point.
async fn pause(stop_rx: &mut watch::Receiver<bool>, duration: std::time::Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = stop_rx.changed() => true,
    }
}

async fn run_entry(
    shared: &Arc<PlanShared>,
    entry: &PlanEntry,
    stop_rx: &watch::Receiver<bool>,
) -> EntryExit {
    let mut stop_rx = stop_rx.clone();
    let target = entry.target_count as u64;
    let mut observed = shared
        .observed
        .lock()
        .unwrap()
        .get(&entry.subreddit)
        .copied()
        .unwrap_or(0);
    let mut cursor: Option<String> = None;
    let mut attempts = 0u32;

    while observed < target {
        if *stop_rx.borrow() {
            return EntryExit::Stopped;
        }
        if shared.failed() {
            return EntryExit::SessionFailed;
        }

        let remaining = (target - observed) as u32;
        let fetch = shared.client.list_posts(
            &entry.subreddit,
            entry.sort,
            entry.time_filter,
            remaining.min(MAX_PAGE_SIZE),
            cursor.as_deref(),
        );
        // In-flight admission waits are cancelled by stop; an in-flight
        // HTTP fetch inside `list_posts` is simply dropped here, before
        // any counters were touched, so counts stay correct.
        let result = tokio::select! {
            result = fetch => result,
            _ = stop_rx.changed() => return EntryExit::Stopped,
        };

        match result {
            Ok(page) => {
                *shared.circuit_blocked_since.lock().unwrap() = None;
                let exhausted = page.next_cursor.is_none();
                match commit_page(shared, entry, page.posts, &mut stop_rx).await {
                    Ok(newly) => {
                        attempts = 0;
                        observed += newly;
                    }
                    Err(CommitError::Stopped) => return EntryExit::Stopped,
                    Err(CommitError::Fatal(message)) => {
                        shared.fail(message);
                        return EntryExit::SessionFailed;
                    }
                    Err(CommitError::Transient(message)) => {
                        attempts += 1;
                        if exhausted_retries(shared, entry, attempts, &message).await {
                            return EntryExit::Done;
                        }
                        if pause(&mut stop_rx, backoff(shared, attempts)).await {
                            return EntryExit::Stopped;
                        }
                        continue;
                    }
                }
                cursor = page.next_cursor;
                if exhausted {
                    debug!(subreddit = %entry.subreddit, observed, "listing exhausted");
                    break;
                }
            }
            Err(ScrapeError::CircuitOpen { retry_after, .. }) => {
                let snapshot = shared.client.circuit().snapshot();
                shared.metrics.record(
                    MetricSample::new("circuit_state", Utc::now(), 0, false)
                        .tag("endpoint", snapshot.endpoint)
                        .tag("state", snapshot.state.as_str()),
                );
                // Downtime budget, not the retry budget, bounds this.
                let blocked_for = {
                    let mut since = shared.circuit_blocked_since.lock().unwrap();
                    since.get_or_insert_with(Instant::now).elapsed()
                };
                if blocked_for > shared.client.circuit().cool_down() * 5 {
                    shared.fail("circuit open past its downtime budget".into());
                    return EntryExit::SessionFailed;
                }
                let nap = (shared.client.circuit().cool_down() / 2).min(retry_after.max(
                    std::time::Duration::from_millis(10),
                ));
                if pause(&mut stop_rx, nap).await {
                    return EntryExit::Stopped;
                }
            }
            Err(ScrapeError::Cancelled) => return EntryExit::Stopped,
            Err(e) if e.is_transient() => {
                attempts += 1;
                if exhausted_retries(shared, entry, attempts, &e.to_string()).await {
                    return EntryExit::Done;
                }
                if pause(&mut stop_rx, backoff(shared, attempts)).await {
                    return EntryExit::Stopped;
                }
            }
            Err(e) => {
                // Private, banned, or nonexistent subreddit. Structured
                // error, next entry; never fatal on its own.
                warn!(subreddit = %entry.subreddit, error = %e, "permanent entry failure");
                record_entry_error(shared, entry, &e.to_string()).await;
                return EntryExit::Done;
            }
        }
    }

    EntryExit::Done
}

fn backoff(shared: &PlanShared, attempt: u32) -> std::time::Duration {
    let base = shared.config.worker_backoff_base.as_secs_f64();
    let delay = base * 1.5_f64.powi(attempt.saturating_sub(1) as i32);
    std::time::Duration::from_secs_f64(delay).min(shared.config.worker_backoff_cap)
}

/// True when the per-entry retry budget is gone and the entry was
/// abandoned (session error recorded, budget checked).
async fn exhausted_retries(
    shared: &Arc<PlanShared>,
    entry: &PlanEntry,
    attempts: u32,
    message: &str,
) -> bool {
    if attempts <= shared.config.worker_retries {
        return false;
    }
    warn!(subreddit = %entry.subreddit, message, "entry retries exhausted");
    record_entry_error(shared, entry, message).await;
    true
}

async fn record_entry_error(shared: &Arc<PlanShared>, entry: &PlanEntry, message: &str) {
    shared.metrics.record(
        MetricSample::new("entry_error", Utc::now(), 0, false)
            .tag("subreddit", entry.subreddit.clone())
            .tag("error", message.to_string()),
    );
    match shared.store.bump_session_errors(shared.session_id, 1).await {
        Ok(total) => {
            let budget = shared.plan.len() as u64 * 3;
            if total > budget {
                shared.fail(format!(
                    "error budget exceeded ({total} errors over {} entries)",
                    shared.plan.len()
                ));
            }
        }
        Err(e) => warn!("error counter update failed: {e}"),
    }
}

enum CommitError {
    Transient(String),
    Stopped,
    Fatal(String),
}

/// Filter, enrich, annotate, and commit one page of posts. Returns the
/// number of posts newly attributed to the session.
async fn commit_page(
    shared: &Arc<PlanShared>,
    entry: &PlanEntry,
    posts: Vec<Post>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<u64, CommitError> {
    let now = Utc::now();
    let options = &shared.options;

    // Filters run before the cap: rejected posts consume no capacity.
    let mut batch: Vec<Post> = posts
        .into_iter()
        .filter(|p| {
            if options.exclude_nsfw && p.is_nsfw {
                return false;
            }
            if options.exclude_deleted && p.is_deleted() {
                return false;
            }
            if p.score < options.min_score {
                return false;
            }
            p.age_days(now) <= options.max_age_days
        })
        .collect();

    {
        let observed = shared.observed.lock().unwrap();
        let seen = observed.get(&entry.subreddit).copied().unwrap_or(0);
        let remaining = (entry.target_count as u64).saturating_sub(seen) as usize;
        batch.truncate(remaining);
    }
    if batch.is_empty() {
        return Ok(0);
    }

    if options.extract_content {
        let mut seen_urls = shared.seen_urls.lock().await;
        shared.enricher.enrich_batch(&mut batch, &mut seen_urls).await;
    }
    analytics::annotate_batch(&mut batch, now);

    let started = Instant::now();
    let newly = match shared
        .store
        .upsert_posts(&batch, shared.session_id)
        .await
    {
        Ok(newly) => newly,
        Err(e) if e.is_transient() => return Err(CommitError::Transient(e.to_string())),
        Err(e) => return Err(CommitError::Fatal(format!("batch commit failed: {e}"))),
    };
    shared.metrics.record(
        MetricSample::new("batch_commit", now, started.elapsed().as_millis() as u64, true)
            .tag("subreddit", entry.subreddit.clone()),
    );
    {
        let mut observed = shared.observed.lock().unwrap();
        *observed.entry(entry.subreddit.clone()).or_default() += newly;
    }

    let mut users_stored = 0u64;
    if options.include_users {
        if *stop_rx.borrow() {
            // Between-batch stop point; the committed batch stands.
            return Err(CommitError::Stopped);
        }
        users_stored = scrape_users(shared, &batch).await;
    }

    shared.bus.publish(Event::StoreWrite {
        session_id: shared.session_id,
        posts: newly,
        users: users_stored,
        ts: Utc::now(),
    });
    publish_progress(shared, false).await;

    Ok(newly)
}

/// Fetch and upsert profiles for authors this session hasn't seen yet.
/// Profile failures never fail the batch.
async fn scrape_users(shared: &Arc<PlanShared>, batch: &[Post]) -> u64 {
    let mut fresh: Vec<String> = Vec::new();
    {
        let mut seen = shared.seen_users.lock().await;
        for post in batch {
            if let Some(author) = &post.author {
                if seen.insert(author.clone()) {
                    fresh.push(author.clone());
                }
            }
        }
    }

    let mut users: Vec<User> = Vec::new();
    for username in fresh {
        match shared.client.get_user(&username).await {
            Ok(Some(user)) => users.push(user),
            Ok(None) => {}
            Err(e) => {
                debug!(username = %username, error = %e, "profile fetch failed");
                shared.metrics.record(
                    MetricSample::new("user_fetch", Utc::now(), 0, false)
                        .tag("username", username),
                );
            }
        }
    }
    if users.is_empty() {
        return 0;
    }
    match shared.store.upsert_users(&users, shared.session_id).await {
        Ok(stored) => stored,
        Err(e) => {
            warn!("user batch commit failed: {e}");
            0
        }
    }
}

/// Recompute and publish session progress, coalesced to one publish per
/// coalesce interval unless forced.
pub(super) async fn publish_progress(shared: &Arc<PlanShared>, force: bool) {
    {
        let mut last = shared.last_publish.lock().unwrap();
        if !force && last.elapsed() < shared.config.progress_coalesce {
            return;
        }
        *last = Instant::now();
    }

    let pairs = shared.observed_pairs();
    let progress = Session::compute_progress(&shared.plan, &pairs);
    let posts_scraped: u64 = pairs.iter().map(|(_, n)| n).sum();

    if let Err(e) = shared
        .store
        .update_session_progress(shared.session_id, progress)
        .await
    {
        warn!("progress update failed: {e}");
    }
    shared.bus.publish(Event::Progress {
        session_id: shared.session_id,
        progress,
        posts_scraped,
        ts: Utc::now(),
    });
}
