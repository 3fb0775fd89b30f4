//! Session row persistence.
//!
//! Counter columns (`posts_scraped`, `users_scraped`) are bumped only
//! inside batch-commit transactions (see `posts.rs`/`users.rs`); the
//! targeted updates here deliberately leave them alone so concurrent
//! workers can't clobber each other's increments.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::Store;
use crate::error::Result;
use crate::models::{Session, SessionStatus};

/// Filter for session listings.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub limit: u32,
}

impl Store {
    /// Persist a freshly created session (status `queued`, plan
    /// included) before any fetch begins.
    pub async fn create_session(&self, session: &Session) -> Result<()> {
        let session = session.clone();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO sessions (
                    session_id, subreddits, plan, status, posts_scraped,
                    users_scraped, errors, progress, start_time, end_time,
                    error_message, options, last_heartbeat
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    session.session_id.to_string(),
                    serde_json::to_string(&session.subreddits).unwrap_or_default(),
                    serde_json::to_string(&session.plan).unwrap_or_default(),
                    session.status.as_str(),
                    session.posts_scraped as i64,
                    session.users_scraped as i64,
                    session.errors as i64,
                    session.progress,
                    session.start_time.to_rfc3339(),
                    session.end_time.map(|t| t.to_rfc3339()),
                    session.error_message,
                    serde_json::to_string(&session.options).unwrap_or_default(),
                    session.last_heartbeat.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Transition a session's status, but only from one of the expected
    /// prior states. Returns whether the row changed; a `false` means
    /// the session raced into another state first (or is unknown), and
    /// the caller's transition loses. Terminal transitions carry an end
    /// time; failures carry a message.
    pub async fn transition_session(
        &self,
        session_id: Uuid,
        to: SessionStatus,
        from: &[SessionStatus],
        error_message: Option<&str>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let key = session_id.to_string();
        let message = error_message.map(|s| s.to_string());
        let from: Vec<String> = from.iter().map(|s| format!("'{}'", s.as_str())).collect();
        let sql = format!(
            "UPDATE sessions SET status = ?1,
                 error_message = COALESCE(?2, error_message),
                 end_time = COALESCE(?3, end_time)
             WHERE session_id = ?4 AND status IN ({})",
            from.join(", ")
        );
        self.with_retry(move |conn| {
            let changed = conn.execute(
                &sql,
                params![
                    to.as_str(),
                    message,
                    end_time.map(|t| t.to_rfc3339()),
                    key
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Record progress (monotonic: the stored value never decreases
    /// while a session runs) and refresh the heartbeat.
    pub async fn update_session_progress(&self, session_id: Uuid, progress: f64) -> Result<()> {
        let key = session_id.to_string();
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE sessions SET progress = MAX(progress, ?1), last_heartbeat = ?2
                 WHERE session_id = ?3",
                params![progress, Utc::now().to_rfc3339(), key],
            )?;
            Ok(())
        })
        .await
    }

    /// Reset progress to zero for an honored resume of a failed session.
    pub async fn reset_session_progress(&self, session_id: Uuid) -> Result<()> {
        let key = session_id.to_string();
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE sessions SET progress = 0.0 WHERE session_id = ?1",
                params![key],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn bump_session_errors(&self, session_id: Uuid, by: u64) -> Result<u64> {
        let key = session_id.to_string();
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE sessions SET errors = errors + ?1 WHERE session_id = ?2",
                params![by as i64, key],
            )?;
            let errors: i64 = conn.query_row(
                "SELECT errors FROM sessions WHERE session_id = ?1",
                params![key],
                |row| row.get(0),
            )?;
            Ok(errors as u64)
        })
        .await
    }

    pub async fn touch_heartbeat(&self, session_id: Uuid) -> Result<()> {
        let key = session_id.to_string();
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE sessions SET last_heartbeat = ?1 WHERE session_id = ?2",
                params![Utc::now().to_rfc3339(), key],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        let key = session_id.to_string();
        self.with_retry(move |conn| {
            let session = conn
                .query_row(
                    "SELECT * FROM sessions WHERE session_id = ?1",
                    params![key],
                    row_to_session,
                )
                .optional()?;
            Ok(session)
        })
        .await
    }

    pub async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let filter = filter.clone();
        self.with_retry(move |conn| {
            let limit = if filter.limit == 0 { 100 } else { filter.limit };
            let sessions = match filter.status {
                Some(status) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM sessions WHERE status = ?1
                         ORDER BY start_time DESC LIMIT ?2",
                    )?;
                    let rows = stmt
                        .query_map(params![status.as_str(), limit], row_to_session)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM sessions ORDER BY start_time DESC LIMIT ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![limit], row_to_session)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(sessions)
        })
        .await
    }

    /// Sessions to re-materialize at boot: queued, running, stopping.
    pub async fn load_active_sessions(&self) -> Result<Vec<Session>> {
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM sessions
                 WHERE status IN ('queued', 'running', 'stopping')
                 ORDER BY start_time ASC",
            )?;
            let sessions = stmt
                .query_map([], row_to_session)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(sessions)
        })
        .await
    }

    /// Per-subreddit counts of posts already attributed to a session.
    /// Drives progress recomputation and resume.
    pub async fn observed_counts(&self, session_id: Uuid) -> Result<Vec<(String, u64)>> {
        let key = session_id.to_string();
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT p.subreddit, COUNT(*)
                 FROM post_by_session ps
                 JOIN posts p ON p.id = ps.post_id
                 WHERE ps.session_id = ?1
                 GROUP BY p.subreddit",
            )?;
            let counts = stmt
                .query_map(params![key], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(counts)
        })
        .await
    }

    /// Running sessions whose heartbeat is older than the cutoff.
    pub async fn stale_running_sessions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let cutoff = older_than.to_rfc3339();
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id FROM sessions
                 WHERE status = 'running' AND last_heartbeat < ?1",
            )?;
            let ids = stmt
                .query_map(params![cutoff], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .filter_map(|s| Uuid::parse_str(&s).ok())
                .collect();
            Ok(ids)
        })
        .await
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let session_id: String = row.get("session_id")?;
    let subreddits: String = row.get("subreddits")?;
    let plan: String = row.get("plan")?;
    let status: String = row.get("status")?;
    let options: String = row.get("options")?;
    let start_time: String = row.get("start_time")?;
    let end_time: Option<String> = row.get("end_time")?;
    let last_heartbeat: String = row.get("last_heartbeat")?;

    let parse_ts = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::UNIX_EPOCH)
    };

    Ok(Session {
        session_id: Uuid::parse_str(&session_id).unwrap_or_default(),
        subreddits: serde_json::from_str(&subreddits).unwrap_or_default(),
        plan: serde_json::from_str(&plan).unwrap_or_default(),
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Failed),
        posts_scraped: row.get::<_, i64>("posts_scraped")? as u64,
        users_scraped: row.get::<_, i64>("users_scraped")? as u64,
        errors: row.get::<_, i64>("errors")? as u64,
        progress: row.get("progress")?,
        start_time: parse_ts(&start_time),
        end_time: end_time.as_deref().map(parse_ts),
        error_message: row.get("error_message")?,
        options: serde_json::from_str(&options).unwrap_or_default(),
        last_heartbeat: parse_ts(&last_heartbeat),
    })
}
