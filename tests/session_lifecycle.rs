//! End-to-end session scenarios against a mock forum.

mod common;

use std::time::Duration;

use common::{harness, harness_with, HarnessConfig};
use serde_json::json;
use snooscrape::events::{Event, EventKind};
use snooscrape::models::{SessionOptions, SessionStatus};
use snooscrape::store::PostFilter;

#[tokio::test]
async fn happy_path_single_subreddit() {
    let h = harness().await;
    h.forum.seed("python", 10);
    let mut sub = h.bus.subscribe(None);

    let id = h
        .engine
        .start(
            vec!["python".into()],
            10,
            SessionOptions {
                parallel: false,
                ..SessionOptions::default()
            },
        )
        .await
        .unwrap();

    let view = h.wait_terminal(id, Duration::from_secs(10)).await;
    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 10);
    assert!((view.progress - 100.0).abs() < 1e-9);
    assert!(view.end_time.unwrap() >= view.start_time);

    // Give the in-flight terminal event a moment to land.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Exactly one started, at least one progress, exactly one completed.
    let mut started = 0;
    let mut progress_events = Vec::new();
    let mut completed = 0;
    while let Ok(event) = sub.rx.try_recv() {
        match event {
            Event::SessionStarted { .. } => started += 1,
            Event::Progress { progress, .. } => progress_events.push(progress),
            Event::SessionCompleted { posts_scraped, .. } => {
                completed += 1;
                assert_eq!(posts_scraped, 10);
            }
            _ => {}
        }
    }
    assert_eq!(started, 1);
    assert_eq!(completed, 1);
    assert!(!progress_events.is_empty());
    // Progress is monotone non-decreasing and bounded.
    for pair in progress_events.windows(2) {
        assert!(pair[1] >= pair[0]);
    }
    assert!(progress_events.iter().all(|p| (0.0..=100.0).contains(p)));

    let page = h.store.query_posts(&PostFilter::default()).await.unwrap();
    assert_eq!(page.total, 10);
}

#[tokio::test]
async fn parallel_two_subreddits() {
    let h = harness().await;
    h.forum.seed("a", 20);
    h.forum.seed("b", 20);

    let id = h
        .engine
        .start(
            vec!["a".into(), "b".into()],
            5,
            SessionOptions {
                parallel: true,
                max_workers: 2,
                ..SessionOptions::default()
            },
        )
        .await
        .unwrap();

    let view = h.wait_terminal(id, Duration::from_secs(10)).await;
    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 10);
    assert!((view.progress - 100.0).abs() < 1e-9);

    let observed = h.store.observed_counts(id).await.unwrap();
    for sub in ["a", "b"] {
        let count = observed
            .iter()
            .find(|(s, _)| s == sub)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        assert_eq!(count, 5, "entry {sub} reached its target");
    }
}

#[tokio::test]
async fn zero_target_completes_immediately() {
    let h = harness().await;
    h.forum.seed("python", 10);

    let id = h
        .engine
        .start(vec!["python".into()], 0, SessionOptions::default())
        .await
        .unwrap();

    let view = h.wait_terminal(id, Duration::from_secs(5)).await;
    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 0);
    assert!((view.progress - 100.0).abs() < 1e-9);
    assert_eq!(h.forum.hits(), 0, "no fetches for an empty plan");
}

#[tokio::test]
async fn stop_during_run_cancels_within_drain_window() {
    let h = harness_with(HarnessConfig {
        rate: 10.0, // slow the session down enough to stop it mid-flight
        ..HarnessConfig::default()
    })
    .await;
    h.forum.seed("python", 500);
    let mut sub = h.bus.subscribe(Some(vec![EventKind::Progress]));

    let id = h
        .engine
        .start(vec!["python".into()], 500, SessionOptions::default())
        .await
        .unwrap();

    // Wait for the first progress event, then request the stop.
    let first = tokio::time::timeout(Duration::from_secs(10), sub.rx.recv())
        .await
        .expect("progress before timeout")
        .unwrap();
    let posts_at_stop = match first {
        Event::Progress { posts_scraped, .. } => posts_scraped,
        other => panic!("unexpected event {other:?}"),
    };

    let stopping = h.engine.stop(id).await.unwrap().unwrap();
    assert!(
        stopping.status == SessionStatus::Stopping || stopping.status.is_terminal(),
        "stop moves the session toward terminal"
    );

    let view = h.wait_terminal(id, Duration::from_secs(5)).await;
    assert_eq!(view.status, SessionStatus::Cancelled);
    // Bounded drain: well within drain_timeout (3s here) + 2s.
    let elapsed = view.end_time.unwrap() - view.start_time;
    assert!(elapsed.num_seconds() <= 5);
    // Counters never decrease.
    assert!(view.posts_scraped >= posts_at_stop);

    // Stop is idempotent on terminal sessions.
    let again = h.engine.stop(id).await.unwrap().unwrap();
    assert_eq!(again.status, SessionStatus::Cancelled);
}

#[tokio::test]
async fn transient_outage_recovers() {
    let h = harness().await;
    h.forum.seed("python", 10);
    h.forum.fail_next(3);

    let id = h
        .engine
        .start(vec!["python".into()], 10, SessionOptions::default())
        .await
        .unwrap();

    let view = h.wait_terminal(id, Duration::from_secs(15)).await;
    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 10);
    assert!(view.errors <= 3);

    // No duplicates: replayed pages collapse on the primary key.
    let page = h.store.query_posts(&PostFilter::default()).await.unwrap();
    assert_eq!(page.total, 10);
}

#[tokio::test]
async fn continuous_failures_trip_circuit_and_fail_session() {
    let h = harness().await;
    h.forum.seed("python", 10);
    h.forum.always_fail(true);
    let mut sub = h.bus.subscribe(Some(vec![EventKind::SessionFailed]));

    let id = h
        .engine
        .start(vec!["python".into()], 10, SessionOptions::default())
        .await
        .unwrap();

    // cool_down is 200ms in the harness; the downtime budget is 5x
    // that, so the session must fail within a few seconds.
    let view = h.wait_terminal(id, Duration::from_secs(10)).await;
    assert_eq!(view.status, SessionStatus::Failed);
    assert!(view.error_message.is_some());

    let event = tokio::time::timeout(Duration::from_secs(2), sub.rx.recv())
        .await
        .expect("failure event")
        .unwrap();
    assert!(matches!(event, Event::SessionFailed { .. }));

    // No post writes happened.
    let page = h.store.query_posts(&PostFilter::default()).await.unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn min_score_filters_before_cap() {
    let h = harness().await;
    // Scores run 0..=19; only 10 posts clear min_score=10.
    h.forum.seed("python", 20);

    let id = h
        .engine
        .start(
            vec!["python".into()],
            5,
            SessionOptions {
                min_score: 10,
                ..SessionOptions::default()
            },
        )
        .await
        .unwrap();

    let view = h.wait_terminal(id, Duration::from_secs(10)).await;
    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 5);

    let page = h.store.query_posts(&PostFilter::default()).await.unwrap();
    assert_eq!(page.total, 5);
    assert!(
        page.posts.iter().all(|p| p.score >= 10),
        "filtered-out posts consumed no capacity"
    );
}

#[tokio::test]
async fn nsfw_and_deleted_posts_are_excluded() {
    let h = harness().await;
    h.forum.seed_with("python", 12, |i| {
        let mut post = common::raw_post("python", i);
        if i % 3 == 0 {
            post["over_18"] = json!(true);
        }
        if i % 3 == 1 {
            post["author"] = json!("[deleted]");
        }
        post
    });

    let id = h
        .engine
        .start(vec!["python".into()], 12, SessionOptions::default())
        .await
        .unwrap();

    let view = h.wait_terminal(id, Duration::from_secs(10)).await;
    assert_eq!(view.status, SessionStatus::Completed);
    // Only every third post survives the filters.
    assert_eq!(view.posts_scraped, 4);
}

#[tokio::test]
async fn include_users_scrapes_authors() {
    let h = harness().await;
    h.forum.seed("python", 9);

    let id = h
        .engine
        .start(
            vec!["python".into()],
            9,
            SessionOptions {
                include_users: true,
                ..SessionOptions::default()
            },
        )
        .await
        .unwrap();

    let view = h.wait_terminal(id, Duration::from_secs(10)).await;
    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 9);
    // The seed rotates three authors.
    assert_eq!(view.users_scraped, 3);
    assert!(h.store.get_user("author0").await.unwrap().is_some());
}

#[tokio::test]
async fn resume_failed_session_reaches_full_target() {
    let h = harness().await;
    h.forum.seed("python", 20);

    // Run against a dead forum so the session fails after partial work.
    h.forum.always_fail(true);
    let id = h
        .engine
        .start(vec!["python".into()], 20, SessionOptions::default())
        .await
        .unwrap();
    let failed = h.wait_terminal(id, Duration::from_secs(10)).await;
    assert_eq!(failed.status, SessionStatus::Failed);

    // Forum recovers; an honored resume restarts the original plan.
    h.forum.always_fail(false);
    // Let the circuit cool down so the first probe can go through.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let resumed = h.engine.resume(id).await.unwrap().unwrap();
    assert!(matches!(
        resumed.status,
        SessionStatus::Queued | SessionStatus::Running | SessionStatus::Completed
    ));

    let view = h.wait_terminal(id, Duration::from_secs(10)).await;
    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 20);

    let page = h.store.query_posts(&PostFilter::default()).await.unwrap();
    assert_eq!(page.total, 20, "exactly the distinct target ids");
}

#[tokio::test]
async fn boot_restore_requeues_interrupted_run() {
    let h = harness().await;
    h.forum.seed("python", 20);

    // Simulate a session interrupted mid-run by a crash: commit part of
    // the work, leave the row marked running with a live plan.
    let session = snooscrape::models::Session::new(
        vec!["python".into()],
        20,
        SessionOptions::default(),
    );
    let id = session.session_id;
    h.store.create_session(&session).await.unwrap();
    assert!(h
        .store
        .transition_session(
            id,
            SessionStatus::Running,
            &[SessionStatus::Queued],
            None,
            None,
        )
        .await
        .unwrap());

    let first_eight: Vec<snooscrape::models::Post> = (0..8)
        .map(|i| {
            let raw: snooscrape::models::RawPost =
                serde_json::from_value(common::raw_post("python", i)).unwrap();
            snooscrape::models::Post::from_raw(raw, chrono::Utc::now()).unwrap()
        })
        .collect();
    h.store.upsert_posts(&first_eight, id).await.unwrap();

    // Boot: the engine restores it (running -> queued -> running) and
    // finishes the remaining work idempotently.
    let restored = h.engine.resume_active().await.unwrap();
    assert_eq!(restored, 1);

    let view = h.wait_terminal(id, Duration::from_secs(10)).await;
    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 20);

    let page = h.store.query_posts(&PostFilter::default()).await.unwrap();
    assert_eq!(page.total, 20, "restart commits no duplicates");
}

#[tokio::test]
async fn unknown_subreddit_is_recorded_not_fatal() {
    let h = harness().await;
    h.forum.seed("real", 5);
    // "ghost" is not seeded; the mock answers 404.

    let id = h
        .engine
        .start(
            vec!["ghost".into(), "real".into()],
            5,
            SessionOptions {
                parallel: false,
                ..SessionOptions::default()
            },
        )
        .await
        .unwrap();

    let view = h.wait_terminal(id, Duration::from_secs(10)).await;
    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 5);
    assert!(view.errors >= 1, "the missing subreddit left a mark");
}
