//! HTTP handlers for the control API.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::analytics;
use crate::engine::SessionListFilter;
use crate::error::ScrapeError;
use crate::models::{SessionOptions, SessionStatus, SortOrder, TimeFilter};
use crate::store::PostFilter;

use super::AppState;

/// Error envelope: validation maps to 400, unknown ids to 404,
/// store/circuit pressure to 503, everything else to a stripped 500.
pub enum ApiError {
    BadRequest(String),
    NotFound,
    Unavailable(String),
    Internal,
}

impl From<ScrapeError> for ApiError {
    fn from(e: ScrapeError) -> Self {
        match e {
            ScrapeError::Permanent(msg) if msg.starts_with("validation:") => {
                ApiError::BadRequest(msg.trim_start_matches("validation:").trim().to_string())
            }
            ScrapeError::Permanent(_) => ApiError::NotFound,
            ScrapeError::StoreBusy => ApiError::Unavailable("store busy".into()),
            ScrapeError::CircuitOpen { endpoint, .. } => {
                ApiError::Unavailable(format!("{endpoint} temporarily unavailable"))
            }
            ScrapeError::Transient(_) => ApiError::Unavailable("temporarily unavailable".into()),
            // Detail stripped from 5xx responses.
            _ => ApiError::Internal,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn parse_session_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid session id: {raw}")))
}

pub async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.store.database_stats().await?;
    Ok(Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "active_sessions": state.engine.active_count(),
        "subscribers": state.bus.subscriber_count(),
        "database": { "posts": stats.posts, "sessions": stats.sessions },
    })))
}

pub async fn config_view(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.public_config.clone())
}

#[derive(Debug, Deserialize)]
pub struct ScrapeRequest {
    pub subreddits: Vec<String>,
    #[serde(default = "default_posts_per_subreddit")]
    pub posts_per_subreddit: u32,
    #[serde(default)]
    pub sort: SortOrder,
    #[serde(default)]
    pub time_filter: TimeFilter,
    #[serde(default)]
    pub include_users: bool,
    #[serde(default)]
    pub extract_content: bool,
    #[serde(default = "default_true")]
    pub parallel: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    #[serde(default)]
    pub min_score: i64,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
}

fn default_posts_per_subreddit() -> u32 {
    100
}
fn default_true() -> bool {
    true
}
fn default_max_workers() -> u32 {
    5
}
fn default_max_age_days() -> i64 {
    365
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub session_id: Uuid,
    pub status: &'static str,
}

pub async fn scrape_start(
    State(state): State<AppState>,
    Json(request): Json<ScrapeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.subreddits.iter().all(|s| s.trim().is_empty()) {
        return Err(ApiError::BadRequest(
            "at least one subreddit is required".into(),
        ));
    }
    if request.max_workers == 0 {
        return Err(ApiError::BadRequest("max_workers must be at least 1".into()));
    }

    let options = SessionOptions {
        parallel: request.parallel,
        include_users: request.include_users,
        extract_content: request.extract_content,
        max_workers: request.max_workers,
        sort: request.sort,
        time_filter: request.time_filter,
        min_score: request.min_score,
        max_age_days: request.max_age_days,
        ..SessionOptions::default()
    };
    let session_id = state
        .engine
        .start(request.subreddits, request.posts_per_subreddit, options)
        .await?;
    Ok(Json(StartResponse {
        session_id,
        status: "started",
    }))
}

pub async fn scrape_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session_id(&id)?;
    let view = state.engine.status(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
}

pub async fn scrape_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            SessionStatus::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {raw}")))?,
        ),
        None => None,
    };
    let sessions = state
        .engine
        .list(SessionListFilter {
            status,
            limit: query.limit.unwrap_or(100),
        })
        .await?;
    Ok(Json(json!({
        "sessions": sessions,
        "active_count": state.engine.active_count(),
    })))
}

pub async fn scrape_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session_id(&id)?;
    let view = state.engine.stop(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(view))
}

pub async fn scrape_resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session_id(&id)?;
    let view = state.engine.resume(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
pub struct PostsQuery {
    pub subreddit: Option<String>,
    pub min_score: Option<i64>,
    pub days_back: Option<i64>,
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn data_posts(
    State(state): State<AppState>,
    Query(query): Query<PostsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state
        .store
        .query_posts(&PostFilter {
            subreddit: query.subreddit,
            min_score: query.min_score,
            days_back: query.days_back,
            search: query.search,
            limit: query.limit.unwrap_or(50).min(500),
            offset: query.offset.unwrap_or(0),
        })
        .await?;
    Ok(Json(json!({
        "posts": page.posts,
        "total": page.total,
    })))
}

pub async fn stats_database(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.store.database_stats().await?;
    let metrics = state.store.metrics_summary().await?;
    Ok(Json(json!({
        "database": stats,
        "operations": metrics,
        "slow_subscriber_drops": state.bus.drop_counts(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub subreddit: Option<String>,
    pub days_back: Option<i64>,
}

pub async fn stats_trends(
    State(state): State<AppState>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let days_back = query.days_back.unwrap_or(7).clamp(1, 365);
    let posts = state
        .store
        .posts_for_analytics(query.subreddit.as_deref(), days_back)
        .await?;
    Ok(Json(analytics::summarize_trends(
        &posts,
        days_back,
        Utc::now(),
    )))
}

pub async fn stats_sentiment(
    State(state): State<AppState>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let days_back = query.days_back.unwrap_or(7).clamp(1, 365);
    // Sentiment only runs over bounded sets; larger result sets are
    // summarized from the newest posts and flagged as truncated.
    let page = state
        .store
        .query_posts(&PostFilter {
            subreddit: query.subreddit,
            days_back: Some(days_back),
            limit: analytics::SENTIMENT_BATCH_LIMIT as u32,
            ..Default::default()
        })
        .await?;
    let truncated = page.total > analytics::SENTIMENT_BATCH_LIMIT as u64;
    let summary = analytics::summarize_sentiment(&page.posts);
    let mut body = serde_json::to_value(&summary).map_err(|_| ApiError::Internal)?;
    body["total_posts"] = json!(page.total);
    body["truncated"] = json!(truncated);
    Ok(Json(body))
}
