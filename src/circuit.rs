//! Per-endpoint circuit breaker.
//!
//! `closed -> open` once failures inside the rolling window reach the
//! threshold; `open -> half_open` after the cool-down; `half_open ->
//! closed` after consecutive probe successes, any probe failure reopens.
//! While open, calls fail fast and consume no admission.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::ScrapeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    /// Failures older than this no longer count toward the threshold.
    pub failure_window: Duration,
    pub cool_down: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cool_down: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Point-in-time view of a breaker, suitable for metrics.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub endpoint: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    pub open_for_ms: Option<u64>,
}

struct CircuitInner {
    state: CircuitState,
    failures: Vec<Instant>,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    /// Start of the current stretch of open-ness; survives the
    /// open -> half_open -> open probe cycle so callers can bound how
    /// long an endpoint has been effectively down.
    down_since: Option<Instant>,
}

pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failures: Vec::new(),
                half_open_successes: 0,
                opened_at: None,
                down_since: None,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn cool_down(&self) -> Duration {
        self.config.cool_down
    }

    /// Gate a call. Fails fast with `CircuitOpen` while the breaker is
    /// open; flips to half-open once the cool-down has elapsed.
    pub fn check(&self) -> Result<(), ScrapeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::Open {
            let opened = inner.opened_at.expect("open circuit has opened_at");
            let since = opened.elapsed();
            if since >= self.config.cool_down {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                info!(endpoint = %self.endpoint, "circuit half-open, probing");
            } else {
                return Err(ScrapeError::CircuitOpen {
                    endpoint: self.endpoint.clone(),
                    retry_after: self.config.cool_down - since,
                });
            }
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures.clear();
                    inner.opened_at = None;
                    inner.down_since = None;
                    info!(endpoint = %self.endpoint, "circuit closed");
                }
            }
            CircuitState::Closed => {
                inner.failures.clear();
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!(endpoint = %self.endpoint, "probe failed, circuit re-opened");
            }
            CircuitState::Closed => {
                let window = self.config.failure_window;
                inner.failures.retain(|t| now.duration_since(*t) < window);
                inner.failures.push(now);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.down_since = Some(now);
                    warn!(
                        endpoint = %self.endpoint,
                        failures = inner.failures.len(),
                        "circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// How long the endpoint has been continuously down (open or probing
    /// after opening). `None` when the breaker has fully closed.
    pub fn down_duration(&self) -> Option<Duration> {
        self.inner.lock().unwrap().down_since.map(|t| t.elapsed())
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().unwrap();
        CircuitSnapshot {
            endpoint: self.endpoint.clone(),
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            half_open_successes: inner.half_open_successes,
            open_for_ms: inner.opened_at.map(|t| t.elapsed().as_millis() as u64),
        }
    }
}
