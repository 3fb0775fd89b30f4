//! Control API surface tests driven through the router.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::harness;
use serde_json::{json, Value};
use snooscrape::server::create_router;
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let h = harness().await;
    let app = create_router(h.app_state());

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["active_sessions"], 0);
}

#[tokio::test]
async fn config_view_is_non_secret() {
    let h = harness().await;
    let app = create_router(h.app_state());

    let response = app.oneshot(get("/config")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json.get("forum_base_url").is_some());
    assert!(json.get("client_secret").is_none());
    assert!(json.get("client_id").is_none());
}

#[tokio::test]
async fn start_requires_subreddits() {
    let h = harness().await;
    let app = create_router(h.app_state());

    let response = app
        .oneshot(post_json(
            "/scrape/start",
            json!({"subreddits": [], "posts_per_subreddit": 5}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("subreddit"));
}

#[tokio::test]
async fn start_rejects_zero_workers() {
    let h = harness().await;
    let app = create_router(h.app_state());

    let response = app
        .oneshot(post_json(
            "/scrape/start",
            json!({"subreddits": ["python"], "max_workers": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn start_status_stop_flow() {
    let h = harness().await;
    h.forum.seed("python", 10);
    let app = create_router(h.app_state());

    let response = app
        .clone()
        .oneshot(post_json(
            "/scrape/start",
            json!({
                "subreddits": ["python"],
                "posts_per_subreddit": 10,
                "sort": "hot",
                "parallel": false
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let started = body_json(response).await;
    let session_id = started["session_id"].as_str().unwrap().to_string();

    // Status is readable immediately.
    let response = app
        .clone()
        .oneshot(get(&format!("/scrape/status/{session_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Stop is accepted regardless of how far the session got.
    let response = app
        .clone()
        .oneshot(delete(&format!("/scrape/stop/{session_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // And idempotent once terminal.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let response = app
        .clone()
        .oneshot(delete(&format!("/scrape/stop/{session_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stopped = body_json(response).await;
    let status = stopped["status"].as_str().unwrap();
    assert!(
        ["cancelled", "completed"].contains(&status),
        "terminal after stop, got {status}"
    );

    let response = app.oneshot(get("/scrape/sessions")).await.unwrap();
    let sessions = body_json(response).await;
    assert_eq!(sessions["sessions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn status_of_unknown_session_is_404() {
    let h = harness().await;
    let app = create_router(h.app_state());

    let response = app
        .clone()
        .oneshot(get(&format!(
            "/scrape/status/{}",
            uuid::Uuid::new_v4()
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.oneshot(get("/scrape/status/not-a-uuid")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn data_posts_filters_and_pages() {
    let h = harness().await;
    h.forum.seed("python", 30);

    let id = h
        .engine
        .start(
            vec!["python".into()],
            30,
            snooscrape::models::SessionOptions::default(),
        )
        .await
        .unwrap();
    h.wait_terminal(id, Duration::from_secs(10)).await;

    let app = create_router(h.app_state());
    let response = app
        .clone()
        .oneshot(get("/data/posts?min_score=20&limit=5"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total"], 10);
    assert_eq!(json["posts"].as_array().unwrap().len(), 5);

    let response = app
        .oneshot(get("/data/posts?search=Post%203&subreddit=python"))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert!(json["total"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn stats_endpoints_respond() {
    let h = harness().await;
    h.forum.seed("python", 10);
    let id = h
        .engine
        .start(
            vec!["python".into()],
            10,
            snooscrape::models::SessionOptions::default(),
        )
        .await
        .unwrap();
    h.wait_terminal(id, Duration::from_secs(10)).await;

    let app = create_router(h.app_state());

    let response = app.clone().oneshot(get("/stats/database")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["database"]["posts"], 10);
    assert_eq!(json["database"]["sessions"], 1);

    let response = app
        .clone()
        .oneshot(get("/stats/trends?days_back=30"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get("/stats/sentiment?subreddit=python"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["analyzed"], 10);
    assert_eq!(json["total_posts"], 10);
    assert_eq!(json["truncated"], false);
}
