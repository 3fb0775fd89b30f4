//! Session lifecycle model.
//!
//! A session is the durable record of one scraping run: the plan it was
//! started with, its live counters, and its place in the state machine
//! `queued -> running -> completed | failed | (stopping -> cancelled)`.
//! Only the session engine mutates these rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Listing sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Hot,
    New,
    Top,
    Rising,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::New => "new",
            Self::Top => "top",
            Self::Rising => "rising",
        }
    }
}

/// Time window applied to `top` listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeFilter {
    Hour,
    Day,
    Week,
    Month,
    Year,
    #[default]
    All,
}

impl TimeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
            Self::All => "all",
        }
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Queued,
    Running,
    Stopping,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States restored and re-materialized at boot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Stopping)
    }
}

/// One unit of planned work: scrape `target_count` posts from one
/// subreddit under a given sort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub subreddit: String,
    pub target_count: u32,
    pub sort: SortOrder,
    pub time_filter: TimeFilter,
}

/// Options captured at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    pub parallel: bool,
    pub include_users: bool,
    pub extract_content: bool,
    pub max_workers: u32,
    pub sort: SortOrder,
    pub time_filter: TimeFilter,
    pub min_score: i64,
    pub max_age_days: i64,
    pub exclude_nsfw: bool,
    pub exclude_deleted: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            include_users: false,
            extract_content: false,
            max_workers: 5,
            sort: SortOrder::Hot,
            time_filter: TimeFilter::All,
            min_score: 0,
            max_age_days: 365,
            exclude_nsfw: true,
            exclude_deleted: true,
        }
    }
}

/// Durable session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub subreddits: Vec<String>,
    pub plan: Vec<PlanEntry>,
    pub status: SessionStatus,
    pub posts_scraped: u64,
    pub users_scraped: u64,
    pub errors: u64,
    pub progress: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub options: SessionOptions,
    pub last_heartbeat: DateTime<Utc>,
}

impl Session {
    /// Create a new queued session with its plan expanded from the
    /// subreddit list.
    pub fn new(subreddits: Vec<String>, posts_per_subreddit: u32, options: SessionOptions) -> Self {
        let now = Utc::now();
        let plan = subreddits
            .iter()
            .map(|s| PlanEntry {
                subreddit: s.clone(),
                target_count: posts_per_subreddit,
                sort: options.sort,
                time_filter: options.time_filter,
            })
            .collect();
        Self {
            session_id: Uuid::new_v4(),
            subreddits,
            plan,
            status: SessionStatus::Queued,
            posts_scraped: 0,
            users_scraped: 0,
            errors: 0,
            progress: 0.0,
            start_time: now,
            end_time: None,
            error_message: None,
            options,
            last_heartbeat: now,
        }
    }

    /// Total target across the plan. Zero-target plans complete at once.
    pub fn total_target(&self) -> u64 {
        self.plan.iter().map(|e| e.target_count as u64).sum()
    }

    /// Progress in [0, 100] given per-entry observed counts, each clamped
    /// to its target.
    pub fn compute_progress(plan: &[PlanEntry], observed: &[(String, u64)]) -> f64 {
        let total: u64 = plan.iter().map(|e| e.target_count as u64).sum();
        if total == 0 {
            return 100.0;
        }
        let done: u64 = plan
            .iter()
            .map(|e| {
                let seen = observed
                    .iter()
                    .find(|(s, _)| s == &e.subreddit)
                    .map(|(_, n)| *n)
                    .unwrap_or(0);
                seen.min(e.target_count as u64)
            })
            .sum();
        (done as f64 / total as f64) * 100.0
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.session_id,
            subreddits: self.subreddits.clone(),
            status: self.status,
            posts_scraped: self.posts_scraped,
            users_scraped: self.users_scraped,
            errors: self.errors,
            progress: self.progress,
            start_time: self.start_time,
            end_time: self.end_time,
            error_message: self.error_message.clone(),
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Read-only projection of a session row for API consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub subreddits: Vec<String>,
    pub status: SessionStatus,
    pub posts_scraped: u64,
    pub users_scraped: u64,
    pub errors: u64,
    pub progress: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
}
