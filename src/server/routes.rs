//! Router configuration for the control API.

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use super::handlers;
use super::ws;
use super::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::config_view))
        // Session lifecycle
        .route("/scrape/start", post(handlers::scrape_start))
        .route("/scrape/status/:id", get(handlers::scrape_status))
        .route("/scrape/sessions", get(handlers::scrape_sessions))
        .route("/scrape/stop/:id", delete(handlers::scrape_stop))
        .route("/scrape/resume/:id", post(handlers::scrape_resume))
        // Data query surface
        .route("/data/posts", get(handlers::data_posts))
        .route("/stats/database", get(handlers::stats_database))
        .route("/stats/trends", get(handlers::stats_trends))
        .route("/stats/sentiment", get(handlers::stats_sentiment))
        // Live event subscription
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
