//! Forum API client.
//!
//! Composes admission -> circuit -> HTTP -> parse behind a uniform
//! fetch/retry contract. Transient transport failures (timeout, 5xx,
//! 429) are retried with jittered exponential backoff before surfacing
//! as `Transient`; other 4xx surface as `Permanent`. Items that fail to
//! parse are skipped individually and the page continues.

mod response;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::admission::{AdmissionController, Outcome};
use crate::circuit::CircuitBreaker;
use crate::error::{Result, ScrapeError};
use crate::models::{Post, SortOrder, TimeFilter, User};

use response::{ListingEnvelope, ProfileEnvelope};

/// Maximum items one listing page may request.
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the forum API; overridable for tests.
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    /// First retry delay; doubled per attempt with ±25% jitter.
    pub retry_base: Duration,
    pub max_retries: u32,
    /// Optional (client_id, client_secret) sent as basic auth.
    pub credentials: Option<(String, String)>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.reddit.com".to_string(),
            user_agent: "snooscrape/0.3 (research)".to_string(),
            timeout: Duration::from_secs(30),
            retry_base: Duration::from_secs(1),
            max_retries: 3,
            credentials: None,
        }
    }
}

/// One page of canonical posts plus pagination state.
#[derive(Debug)]
pub struct ListPage {
    pub posts: Vec<Post>,
    pub next_cursor: Option<String>,
    /// Items dropped by per-item parse failures.
    pub skipped: u32,
}

pub struct ForumClient {
    http: reqwest::Client,
    config: ClientConfig,
    admission: Arc<AdmissionController>,
    circuit: Arc<CircuitBreaker>,
}

impl ForumClient {
    pub fn new(
        config: ClientConfig,
        admission: Arc<AdmissionController>,
        circuit: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .gzip(true)
            .build()
            .map_err(|e| ScrapeError::Fatal(format!("http client init: {e}")))?;
        Ok(Self {
            http,
            config,
            admission,
            circuit,
        })
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    /// Fetch one page of a subreddit listing, at most [`MAX_PAGE_SIZE`]
    /// items, resuming from `cursor` when given.
    pub async fn list_posts(
        &self,
        subreddit: &str,
        sort: SortOrder,
        time_filter: TimeFilter,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<ListPage> {
        let limit = limit.min(MAX_PAGE_SIZE);
        let mut url = format!(
            "{}/r/{}/{}.json?limit={}&raw_json=1",
            self.config.base_url,
            subreddit,
            sort.as_str(),
            limit
        );
        if sort == SortOrder::Top {
            url.push_str(&format!("&t={}", time_filter.as_str()));
        }
        if let Some(after) = cursor {
            url.push_str(&format!("&after={after}"));
        }

        let body = self.fetch_json(&url).await?;
        let envelope: ListingEnvelope = serde_json::from_str(&body)
            .map_err(|e| ScrapeError::Transient(format!("listing decode: {e}")))?;

        let now = Utc::now();
        let mut posts = Vec::with_capacity(envelope.data.children.len());
        let mut skipped = 0u32;
        for child in envelope.data.children {
            let raw = match child.into_raw_post() {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(subreddit = %subreddit, error = %e, "skipping malformed listing item");
                    skipped += 1;
                    continue;
                }
            };
            match Post::from_raw(raw, now) {
                Ok(post) => posts.push(post),
                Err(ScrapeError::Skipped(reason)) => {
                    debug!(subreddit = %subreddit, reason = %reason, "skipping incomplete post");
                    skipped += 1;
                }
                Err(other) => return Err(other),
            }
        }

        Ok(ListPage {
            posts,
            next_cursor: envelope.data.after,
            skipped,
        })
    }

    /// Fetch a user profile. `Ok(None)` covers deleted, suspended, and
    /// never-existing accounts.
    pub async fn get_user(&self, username: &str) -> Result<Option<User>> {
        let url = format!("{}/user/{}/about.json", self.config.base_url, username);
        let body = match self.fetch_json(&url).await {
            Ok(body) => body,
            Err(ScrapeError::Permanent(msg))
                if msg.starts_with("HTTP 404") || msg.starts_with("HTTP 410") =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let envelope: ProfileEnvelope = serde_json::from_str(&body)
            .map_err(|e| ScrapeError::Transient(format!("profile decode: {e}")))?;
        match User::from_raw(envelope.data, Utc::now()) {
            Ok(user) => Ok(Some(user)),
            Err(ScrapeError::Skipped(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// GET with the full admission/circuit/retry ladder.
    async fn fetch_json(&self, url: &str) -> Result<String> {
        let mut attempt = 0u32;
        loop {
            // Fail fast while open; an open circuit consumes no admission.
            self.circuit.check()?;
            self.admission.acquire().await?;

            match self.attempt_get(url).await {
                Ok(body) => {
                    self.admission.record_outcome(Outcome::Ok);
                    self.circuit.record_success();
                    return Ok(body);
                }
                Err(AttemptError::RateLimited) => {
                    self.admission.record_outcome(Outcome::RateLimited);
                    self.circuit.record_failure();
                    if attempt >= self.config.max_retries {
                        return Err(ScrapeError::Transient(format!(
                            "rate limited after {attempt} retries: {url}"
                        )));
                    }
                }
                Err(AttemptError::Transient(msg)) => {
                    self.admission.record_outcome(Outcome::Error);
                    self.circuit.record_failure();
                    if attempt >= self.config.max_retries {
                        return Err(ScrapeError::Transient(msg));
                    }
                }
                Err(AttemptError::Permanent(msg)) => {
                    self.admission.record_outcome(Outcome::Ok);
                    return Err(ScrapeError::Permanent(msg));
                }
            }

            let delay = self.backoff_delay(attempt);
            warn!(url = %url, attempt, delay_ms = delay.as_millis() as u64, "retrying fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt_get(&self, url: &str) -> std::result::Result<String, AttemptError> {
        let mut request = self.http.get(url);
        if let Some((id, secret)) = &self.config.credentials {
            request = request.basic_auth(id, Some(secret));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AttemptError::Transient(format!("timeout: {url}"))
            } else {
                AttemptError::Transient(format!("transport: {e}"))
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::RateLimited);
        }
        if status.is_server_error() {
            return Err(AttemptError::Transient(format!("HTTP {status}: {url}")));
        }
        if status.is_client_error() {
            return Err(AttemptError::Permanent(format!(
                "HTTP {}: {url}",
                status.as_u16()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| AttemptError::Transient(format!("body read: {e}")))
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base.as_secs_f64() * 2f64.powi(attempt as i32);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64(base * jitter)
    }
}

enum AttemptError {
    RateLimited,
    Transient(String),
    Permanent(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionConfig;
    use crate::circuit::CircuitConfig;

    fn client_for(base_url: String) -> ForumClient {
        let admission = Arc::new(AdmissionController::local(AdmissionConfig {
            rate: 200.0,
            max_rate: 200.0,
            ..Default::default()
        }));
        let circuit = Arc::new(CircuitBreaker::new("forum", CircuitConfig::default()));
        ForumClient::new(
            ClientConfig {
                base_url,
                retry_base: Duration::from_millis(10),
                ..Default::default()
            },
            admission,
            circuit,
        )
        .unwrap()
    }

    #[test]
    fn backoff_grows_with_jitter_bounds() {
        let client = client_for("http://unused".into());
        for attempt in 0..3 {
            let d = client.backoff_delay(attempt).as_secs_f64();
            let base = 0.010 * 2f64.powi(attempt as i32);
            assert!(d >= base * 0.75 - 1e-9);
            assert!(d <= base * 1.25 + 1e-9);
        }
    }

    #[test]
    fn page_size_is_capped() {
        assert_eq!(500u32.min(MAX_PAGE_SIZE), 100);
    }
}
