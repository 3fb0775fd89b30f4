//! Adaptive admission control for outbound request pacing.
//!
//! An [`AdmissionController`] paces callers to a target rate and adapts
//! that rate to the observed error mix: a high error rate halves it, a
//! clean stretch nudges it back up. The pacing line itself is pluggable
//! so a fleet of worker processes sharing one store file can also share
//! one line (`sqlite` backend) while single-process runs stay in memory.
//!
//! Contract: a caller that returns from [`AdmissionController::acquire`]
//! must make exactly one attempt and report it via
//! [`AdmissionController::record_outcome`]. A caller cancelled while
//! waiting has not consumed a slot.

mod memory;
mod sqlite;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

pub use memory::MemoryLine;
pub use sqlite::SqliteLine;

/// Outcome of the single attempt made after a successful `acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    RateLimited,
    Error,
}

/// Pacing configuration and adaptation bounds.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Initial requests per second.
    pub rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    /// Rolling outcome window driving adaptation.
    pub window: usize,
    /// Error rate above which the rate is halved.
    pub high_error_rate: f64,
    /// Error rate below which the rate is nudged up.
    pub low_error_rate: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate: 1.0,
            min_rate: 0.1,
            max_rate: 10.0,
            window: 100,
            high_error_rate: 0.30,
            low_error_rate: 0.05,
        }
    }
}

/// Storage for the last-grant timestamp.
///
/// `try_claim` either claims the next slot (returns `None`) or tells the
/// caller how long to wait before trying again. Claims must be atomic
/// across concurrent callers.
#[async_trait]
pub trait PacingLine: Send + Sync {
    async fn try_claim(&self, min_interval: Duration) -> Result<Option<Duration>>;
}

struct AdaptiveState {
    rate: f64,
    outcomes: VecDeque<bool>,
}

/// Rate-adaptive admission token. Cheap to clone via `Arc` at call sites;
/// holders call the token, they never copy its state.
pub struct AdmissionController {
    line: Box<dyn PacingLine>,
    state: Mutex<AdaptiveState>,
    config: AdmissionConfig,
}

/// Minimum evidence before the adaptive policy acts.
const MIN_SAMPLES: usize = 20;

impl AdmissionController {
    /// Process-local controller.
    pub fn local(config: AdmissionConfig) -> Self {
        Self::with_line(Box::new(MemoryLine::new()), config)
    }

    /// Controller whose pacing line lives in a SQLite file shared by
    /// multiple worker processes.
    pub fn shared(path: &std::path::Path, key: &str, config: AdmissionConfig) -> Result<Self> {
        Ok(Self::with_line(Box::new(SqliteLine::open(path, key)?), config))
    }

    pub fn with_line(line: Box<dyn PacingLine>, config: AdmissionConfig) -> Self {
        let rate = config.rate.clamp(config.min_rate, config.max_rate);
        Self {
            line,
            state: Mutex::new(AdaptiveState {
                rate,
                outcomes: VecDeque::new(),
            }),
            config,
        }
    }

    /// Current requests-per-second target.
    pub fn current_rate(&self) -> f64 {
        self.state.lock().unwrap().rate
    }

    fn min_interval(&self) -> Duration {
        let rate = self.current_rate();
        Duration::from_secs_f64(1.0 / rate)
    }

    /// Block until the next pacing slot is granted.
    ///
    /// Cancellation-safe: the slot is only claimed by the final,
    /// non-waiting pass through the line, so dropping this future while
    /// it sleeps consumes nothing.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            match self.line.try_claim(self.min_interval()).await? {
                None => return Ok(()),
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Feed the outcome of the attempt made after `acquire`.
    pub fn record_outcome(&self, outcome: Outcome) {
        let mut state = self.state.lock().unwrap();
        state.outcomes.push_back(matches!(outcome, Outcome::Ok));
        while state.outcomes.len() > self.config.window {
            state.outcomes.pop_front();
        }
        if state.outcomes.len() < MIN_SAMPLES {
            return;
        }

        let errors = state.outcomes.iter().filter(|ok| !**ok).count();
        let error_rate = errors as f64 / state.outcomes.len() as f64;

        if error_rate > self.config.high_error_rate {
            let new_rate = (state.rate * 0.5).max(self.config.min_rate);
            if new_rate < state.rate {
                debug!(error_rate, old = state.rate, new = new_rate, "pacing down");
                state.rate = new_rate;
                // Require fresh evidence before acting again.
                state.outcomes.clear();
            }
        } else if error_rate < self.config.low_error_rate && state.rate < self.config.max_rate {
            let new_rate = (state.rate * 1.1).min(self.config.max_rate);
            debug!(error_rate, old = state.rate, new = new_rate, "pacing up");
            state.rate = new_rate;
            state.outcomes.clear();
        }
    }
}
