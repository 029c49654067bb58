//! Admission control for the publish path.
//!
//! A [`BackpressureController`] bounds the number of operations in flight and
//! optionally their rate. Every admission is an RAII [`BackpressurePermit`];
//! dropping it gives the slot back, so cancellation and early returns can not
//! leak capacity.

mod controller;
mod rate_limit;

pub use controller::{BackpressureController, BackpressurePermit, BackpressureSnapshot};
pub use rate_limit::TokenBucket;

use crate::config::duration_ms;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::Semaphore;

/// What to do when no slot is free
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottlePolicy {
    /// Fail synchronously, never block
    RejectImmediately,
    /// Wait up to `max_wait` for a slot, then fail
    WaitThenRetry,
    /// Wait for a slot with at most `queue_capacity` waiters
    BoundedQueue,
}

impl fmt::Display for ThrottlePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottlePolicy::RejectImmediately => write!(f, "reject_immediately"),
            ThrottlePolicy::WaitThenRetry => write!(f, "wait_then_retry"),
            ThrottlePolicy::BoundedQueue => write!(f, "bounded_queue"),
        }
    }
}

/// Optional rate limit applied after the in-flight check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub permits_per_second: f64,
    pub burst: u32,
}

/// Backpressure settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Maximum operations in flight at once
    pub max_inflight: usize,

    /// Throttle policy once `max_inflight` is reached
    pub policy: ThrottlePolicy,

    /// Upper bound on waiting under `WaitThenRetry`
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,

    /// Maximum number of waiters under `BoundedQueue`
    pub queue_capacity: usize,

    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_inflight: 256,
            policy: ThrottlePolicy::WaitThenRetry,
            max_wait: Duration::from_secs(5),
            queue_capacity: 1024,
            rate_limit: None,
        }
    }
}

impl BackpressureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_inflight == 0 {
            return Err(PipelineError::Configuration(
                "backpressure.max_inflight must be greater than 0".to_string(),
            ));
        }

        if self.max_inflight > Semaphore::MAX_PERMITS {
            return Err(PipelineError::Configuration(format!(
                "backpressure.max_inflight must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }

        if self.policy == ThrottlePolicy::BoundedQueue && self.queue_capacity == 0 {
            return Err(PipelineError::Configuration(
                "backpressure.queue_capacity must be greater than 0 for bounded_queue".to_string(),
            ));
        }

        if let Some(rate) = &self.rate_limit {
            // NaN fails every comparison, so test for the valid range
            let positive_rate = rate.permits_per_second.is_finite() && rate.permits_per_second > 0.0;
            if !positive_rate || rate.burst == 0 {
                return Err(PipelineError::Configuration(
                    "backpressure.rate_limit needs positive permits_per_second and burst"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }
}
