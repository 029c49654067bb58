//! Circuit breaker for transport calls.
//!
//! This module provides:
//! - A Closed/Open/HalfOpen state machine held in a single critical section
//! - Consecutive-failure, failure-rate and slow-call-rate trip conditions
//! - Bounded concurrent probes while half-open
//! - Manual `reset` and `isolate` (kill switch)
//! - Transition and rejection events over a broadcast channel
//! - A registry owned by one pipeline, holding one breaker per destination
//!
//! # Circuit Breaker States
//!
//! - **Closed**: Normal operation, calls pass through, outcomes are counted
//! - **Open**: Fast-fail mode, calls are rejected without being attempted
//! - **Half-Open**: Probing recovery; a limited number of calls go through
//!
//! # Example
//!
//! ```no_run
//! use resilient_messaging::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use resilient_messaging::PipelineError;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(5)
//!     .open_timeout(std::time::Duration::from_secs(1))
//!     .build()?;
//!
//! let breaker = CircuitBreaker::new("orders", config);
//! let value = breaker.call(|| async { Ok::<_, PipelineError>(42) }).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod core;
mod registry;
mod state;

pub use config::{CircuitBreakerConfig, CircuitBreakerConfigBuilder};
pub use core::{CircuitBreaker, CircuitBreakerEvent, CircuitBreakerStats};
pub use registry::{settlement_key, CircuitBreakerRegistry, RegistryHealth, StateCount};
pub use state::{CircuitBreakerState, StateData, StateTransition, TripReason};

use crate::error::PipelineError;

/// Result type for circuit breaker operations
pub type CircuitBreakerResult<T> = std::result::Result<T, CircuitBreakerError>;

/// Errors raised by the circuit breaker itself
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitBreakerError {
    /// Circuit is open and rejecting calls
    #[error("Circuit breaker is open for '{0}'")]
    Open(String),

    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<CircuitBreakerError> for PipelineError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Open(name) => PipelineError::CircuitOpen(name),
            CircuitBreakerError::InvalidConfig(msg) => PipelineError::Configuration(msg),
        }
    }
}
