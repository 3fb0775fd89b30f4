//! Store schema initialization.

use rusqlite::Connection;

use crate::error::Result;

/// Create tables and indices if missing. Idempotent.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS posts (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            author TEXT,
            subreddit TEXT NOT NULL,
            score INTEGER NOT NULL DEFAULT 0,
            upvote_ratio REAL NOT NULL DEFAULT 0.0,
            num_comments INTEGER NOT NULL DEFAULT 0,
            created_utc INTEGER NOT NULL,
            url TEXT NOT NULL,
            permalink TEXT NOT NULL,
            selftext TEXT NOT NULL DEFAULT '',
            link_url TEXT,
            flair TEXT,
            is_nsfw INTEGER NOT NULL DEFAULT 0,
            is_spoiler INTEGER NOT NULL DEFAULT 0,
            is_self INTEGER NOT NULL DEFAULT 0,
            domain TEXT NOT NULL DEFAULT '',
            content_type TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT '',
            engagement_ratio REAL NOT NULL DEFAULT 0.0,
            sentiment_score REAL,
            viral_potential REAL,
            enriched TEXT,
            scraped_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS users (
            username TEXT PRIMARY KEY,
            id TEXT NOT NULL DEFAULT '',
            created_utc INTEGER NOT NULL DEFAULT 0,
            comment_karma INTEGER NOT NULL DEFAULT 0,
            link_karma INTEGER NOT NULL DEFAULT 0,
            is_verified INTEGER NOT NULL DEFAULT 0,
            has_premium INTEGER NOT NULL DEFAULT 0,
            profile_description TEXT NOT NULL DEFAULT '',
            scraped_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            subreddits TEXT NOT NULL,
            plan TEXT NOT NULL,
            status TEXT NOT NULL,
            posts_scraped INTEGER NOT NULL DEFAULT 0,
            users_scraped INTEGER NOT NULL DEFAULT 0,
            errors INTEGER NOT NULL DEFAULT 0,
            progress REAL NOT NULL DEFAULT 0.0,
            start_time TEXT NOT NULL,
            end_time TEXT,
            error_message TEXT,
            options TEXT NOT NULL,
            last_heartbeat TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS post_by_session (
            session_id TEXT NOT NULL,
            post_id TEXT NOT NULL,
            PRIMARY KEY (session_id, post_id)
        );

        CREATE TABLE IF NOT EXISTS metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL,
            operation TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            ok INTEGER NOT NULL,
            memory_delta INTEGER NOT NULL DEFAULT 0,
            tags TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_posts_created_utc ON posts (created_utc);
        CREATE INDEX IF NOT EXISTS idx_posts_subreddit ON posts (subreddit);
        CREATE INDEX IF NOT EXISTS idx_posts_score ON posts (score);
        CREATE INDEX IF NOT EXISTS idx_sessions_status_start
            ON sessions (status, start_time);
        CREATE INDEX IF NOT EXISTS idx_metrics_ts ON metrics (ts);
        "#,
    )?;
    Ok(())
}
