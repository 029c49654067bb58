//! Local retries for transient failures.
//!
//! [`RetryExecutor`] re-runs an operation while a [`TransientClassifier`]
//! says the failure is worth retrying, sleeping between attempts according to
//! a [`BackoffStrategy`]. Whatever ends the loop, the caller gets the last
//! error value back untouched.

mod backoff;
mod executor;

pub use backoff::delay_for_attempt;
pub use executor::{PipelineErrorClassifier, RetryExecutor, TransientClassifier};

use crate::config::duration_ms;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// `initial_delay * attempt`
    Linear,
    /// `initial_delay * 2^(attempt - 1)`
    Exponential,
}

/// Retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,

    /// Cap applied after growth and jitter
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    pub backoff: BackoffStrategy,

    /// Randomize each delay between half and the full computed value
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff: BackoffStrategy::Exponential,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(PipelineError::Configuration(
                "retry.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(PipelineError::Configuration(
                "retry.initial_delay must not exceed retry.max_delay".to_string(),
            ));
        }
        Ok(())
    }
}
