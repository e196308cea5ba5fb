//! Typed retry policy applied at page suspension points.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::page::PageError;

/// Max attempts, exponential backoff and a per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound for a single attempt.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt number `attempt` (1-based, so attempt 2 waits
    /// the initial backoff).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(attempt as i32 - 2);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Runs `op` until it succeeds, a non-transient error occurs, or the
    /// attempts are exhausted. Each attempt is bounded by the attempt timeout.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, PageError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PageError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            let backoff = self.backoff(attempt);
            if !backoff.is_zero() {
                debug!("{}: backing off {:?} before attempt {}", what, backoff, attempt);
                tokio::time::sleep(backoff).await;
            }

            let outcome = match tokio::time::timeout(self.attempt_timeout(), op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(PageError::Timeout {
                    what: what.to_string(),
                    timeout_ms: self.attempt_timeout_ms,
                }),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or(PageError::Timeout {
            what: what.to_string(),
            timeout_ms: self.attempt_timeout_ms,
        }))
    }
}
