//! Shared test harness: a mock forum served over real HTTP plus a fully
//! wired engine/store/bus against it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use snooscrape::admission::{AdmissionConfig, AdmissionController};
use snooscrape::circuit::{CircuitBreaker, CircuitConfig};
use snooscrape::client::{ClientConfig, ForumClient};
use snooscrape::config::Settings;
use snooscrape::engine::{EngineConfig, SessionEngine};
use snooscrape::enrich::{ContentEnricher, EnrichConfig};
use snooscrape::events::EventBus;
use snooscrape::metrics::MetricsSink;
use snooscrape::server::AppState;
use snooscrape::store::Store;

/// In-memory forum behind a real listener, so the client's full
/// HTTP/retry path is exercised.
#[derive(Clone)]
pub struct MockForum {
    state: Arc<ForumState>,
}

pub struct ForumState {
    posts: std::sync::Mutex<HashMap<String, Vec<Value>>>,
    /// Respond 500 to this many requests before recovering.
    fail_next: AtomicU32,
    /// Respond 500 to everything.
    always_fail: AtomicBool,
    hits: AtomicU32,
}

impl MockForum {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ForumState {
                posts: std::sync::Mutex::new(HashMap::new()),
                fail_next: AtomicU32::new(0),
                always_fail: AtomicBool::new(false),
                hits: AtomicU32::new(0),
            }),
        }
    }

    /// Seed `count` well-formed posts for a subreddit. Post ids are
    /// `{subreddit}-{i}`, scores run 0..count.
    pub fn seed(&self, subreddit: &str, count: usize) {
        let posts = (0..count).map(|i| raw_post(subreddit, i)).collect();
        self.state
            .posts
            .lock()
            .unwrap()
            .insert(subreddit.to_string(), posts);
    }

    /// Seed with a custom generator.
    pub fn seed_with(&self, subreddit: &str, count: usize, f: impl Fn(usize) -> Value) {
        let posts = (0..count).map(f).collect();
        self.state
            .posts
            .lock()
            .unwrap()
            .insert(subreddit.to_string(), posts);
    }

    pub fn fail_next(&self, n: u32) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn always_fail(&self, on: bool) {
        self.state.always_fail.store(on, Ordering::SeqCst);
    }

    pub fn hits(&self) -> u32 {
        self.state.hits.load(Ordering::SeqCst)
    }

    /// Bind on an ephemeral port and serve in the background.
    pub async fn spawn(&self) -> String {
        let app = Router::new()
            .route("/r/:sub/:listing", get(listing))
            .route("/user/:name/:about", get(profile))
            .with_state(self.state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }
}

pub fn raw_post(subreddit: &str, i: usize) -> Value {
    // Recent timestamps, spaced an hour apart, newest first.
    let created = chrono::Utc::now().timestamp() - (i as i64) * 3600;
    json!({
        "id": format!("{subreddit}-{i}"),
        "title": format!("Post {i} in r/{subreddit}"),
        "author": format!("author{}", i % 3),
        "subreddit": subreddit,
        "score": i as i64,
        "upvote_ratio": 0.9,
        "num_comments": (i % 7) as i64,
        "created_utc": created as f64,
        "url": format!("https://example.com/{subreddit}/{i}"),
        "permalink": format!("/r/{subreddit}/comments/{i}/post/"),
        "selftext": "body text",
        "over_18": false,
        "spoiler": false,
        "is_self": true,
        "domain": format!("self.{subreddit}"),
    })
}

async fn listing(
    State(state): State<Arc<ForumState>>,
    Path((sub, _listing)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if state.always_fail.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))).into_response();
    }
    if state
        .fail_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))).into_response();
    }

    let posts = state.posts.lock().unwrap();
    let Some(all) = posts.get(&sub) else {
        return (StatusCode::NOT_FOUND, Json(json!({}))).into_response();
    };
    let start: usize = query
        .get("after")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let limit: usize = query
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(25);
    let end = (start + limit).min(all.len());
    let children: Vec<Value> = all[start..end]
        .iter()
        .map(|p| json!({"kind": "t3", "data": p}))
        .collect();
    let after = if end < all.len() {
        Value::String(end.to_string())
    } else {
        Value::Null
    };
    Json(json!({
        "kind": "Listing",
        "data": { "after": after, "children": children }
    }))
    .into_response()
}

async fn profile(
    State(state): State<Arc<ForumState>>,
    Path((name, _about)): Path<(String, String)>,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if state.always_fail.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))).into_response();
    }
    Json(json!({
        "kind": "t2",
        "data": {
            "name": name,
            "id": format!("u_{name}"),
            "created_utc": 1_600_000_000.0,
            "comment_karma": 10,
            "link_karma": 20,
            "verified": false,
            "is_gold": false,
            "subreddit": { "public_description": "test user" }
        }
    }))
    .into_response()
}

/// Fully wired runtime against the mock forum, tuned for fast tests.
pub struct Harness {
    pub engine: Arc<SessionEngine>,
    pub store: Store,
    pub bus: EventBus,
    pub forum: MockForum,
    pub base_url: String,
    _dir: TempDir,
}

pub struct HarnessConfig {
    pub circuit: CircuitConfig,
    pub rate: f64,
    pub engine: EngineConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            circuit: CircuitConfig {
                failure_threshold: 5,
                failure_window: Duration::from_secs(60),
                cool_down: Duration::from_millis(200),
                success_threshold: 2,
            },
            rate: 200.0,
            engine: EngineConfig {
                drain_timeout: Duration::from_secs(3),
                heartbeat_interval: Duration::from_millis(500),
                progress_coalesce: Duration::from_millis(10),
                worker_backoff_base: Duration::from_millis(30),
                worker_backoff_cap: Duration::from_millis(200),
                worker_retries: 5,
            },
        }
    }
}

pub async fn harness() -> Harness {
    harness_with(HarnessConfig::default()).await
}

pub async fn harness_with(config: HarnessConfig) -> Harness {
    let forum = MockForum::new();
    let base_url = forum.spawn().await;

    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("test.db"), 8).await.unwrap();
    let bus = EventBus::new();
    let metrics = MetricsSink::start(store.clone(), bus.clone());

    let admission = Arc::new(AdmissionController::local(AdmissionConfig {
        rate: config.rate,
        max_rate: config.rate.max(10.0),
        ..AdmissionConfig::default()
    }));
    let circuit = Arc::new(CircuitBreaker::new("forum", config.circuit.clone()));
    let client = Arc::new(
        ForumClient::new(
            ClientConfig {
                base_url: base_url.clone(),
                retry_base: Duration::from_millis(20),
                timeout: Duration::from_secs(5),
                ..ClientConfig::default()
            },
            admission,
            circuit,
        )
        .unwrap(),
    );

    let enrich_admission = Arc::new(AdmissionController::local(AdmissionConfig {
        rate: 200.0,
        max_rate: 200.0,
        ..AdmissionConfig::default()
    }));
    let enrich_circuit = Arc::new(CircuitBreaker::new("content", config.circuit));
    let enricher = Arc::new(
        ContentEnricher::new(EnrichConfig::default(), enrich_admission, enrich_circuit).unwrap(),
    );

    let engine = SessionEngine::new(
        store.clone(),
        bus.clone(),
        client,
        enricher,
        metrics,
        config.engine,
    );

    Harness {
        engine,
        store,
        bus,
        forum,
        base_url,
        _dir: dir,
    }
}

impl Harness {
    pub fn app_state(&self) -> AppState {
        AppState {
            engine: self.engine.clone(),
            store: self.store.clone(),
            bus: self.bus.clone(),
            public_config: Settings::default().public_view(),
        }
    }

    /// Poll until the session reaches a terminal status or the timeout
    /// elapses; returns the final view.
    pub async fn wait_terminal(
        &self,
        session_id: uuid::Uuid,
        timeout: Duration,
    ) -> snooscrape::models::SessionView {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let view = self
                .engine
                .status(session_id)
                .await
                .unwrap()
                .expect("session exists");
            if view.status.is_terminal() {
                return view;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("session {session_id} still {:?} after {timeout:?}", view.status);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
