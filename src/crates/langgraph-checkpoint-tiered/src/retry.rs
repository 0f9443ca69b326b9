//! Retry with exponential backoff for backend calls
//!
//! Every call into a [`KeyValueStore`](crate::backend::KeyValueStore) or
//! [`BlobStore`](crate::backend::BlobStore) goes through [`with_retry`]. Each
//! attempt runs under a deadline; `Transient` and `Timeout` failures are
//! retried, everything else is returned at once. Operations handed to
//! `with_retry` must be idempotent.

use crate::error::{BackendError, BackendResult, CheckpointError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retrying failed backend calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: usize,

    /// Initial interval between retries in seconds
    pub initial_interval: f64,

    /// Multiplier for the interval after each retry
    pub backoff_factor: f64,

    /// Maximum interval between retries in seconds
    pub max_interval: f64,

    /// Whether to add random jitter to intervals
    pub jitter: bool,

    /// Deadline for a single attempt in milliseconds
    pub attempt_timeout_ms: u64,
}

impl RetryPolicy {
    /// Create a new retry policy with the given max attempts
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_interval: 0.05,
            backoff_factor: 2.0,
            max_interval: 5.0,
            jitter: true,
            attempt_timeout_ms: 10_000,
        }
    }

    /// Set the initial interval between retries
    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    /// Set the backoff factor
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the maximum interval between retries
    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the per-attempt deadline
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Per-attempt deadline
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Calculate the delay for a given attempt number (0-indexed)
    ///
    /// Uses exponential backoff: initial_interval * (backoff_factor ^ attempt)
    /// Capped at max_interval, with optional jitter in [0.5, 1.5].
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::from_secs(0);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.initial_interval * self.backoff_factor.powi(exponent);
        let capped_delay = base_delay.min(self.max_interval).max(0.0);

        let final_delay = if self.jitter {
            let jitter_factor = rand::thread_rng().gen_range(0.5..=1.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::try_from_secs_f64(final_delay)
            .or_else(|_| Duration::try_from_secs_f64(self.max_interval))
            .unwrap_or(Duration::ZERO)
    }

    /// Whether every interval is a finite, non-negative number of seconds
    pub fn has_valid_intervals(&self) -> bool {
        [self.initial_interval, self.backoff_factor, self.max_interval]
            .iter()
            .all(|value| value.is_finite() && *value >= 0.0)
    }

    /// Check if more attempts are allowed after `attempt` attempts
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Execute a backend call with retry logic
///
/// Returns the first success, the first non-retryable error mapped to
/// [`CheckpointError::Backend`], or [`CheckpointError::Unavailable`] once the
/// attempt budget is spent.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = policy.calculate_delay(attempt - 1);
            debug!(operation, attempt, delay_ms = delay.as_millis() as u64, "Retrying backend call");
            tokio::time::sleep(delay).await;
        }

        let outcome = match tokio::time::timeout(policy.attempt_timeout(), call()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BackendError::Timeout(policy.attempt_timeout_ms)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                debug!(operation, attempt = attempt + 1, error = %err, "Backend call failed transiently");
                last_error = Some(err);
            }
            Err(err) => return Err(CheckpointError::Backend(err)),
        }
    }

    let last_error = last_error
        .map(|err| err.to_string())
        .unwrap_or_else(|| "no attempt made".to_string());
    warn!(operation, attempts, error = %last_error, "Backend call failed, retries exhausted");
    Err(CheckpointError::Unavailable {
        operation: operation.to_string(),
        attempts,
        last_error,
    })
}
