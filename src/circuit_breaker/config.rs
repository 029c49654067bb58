//! Circuit breaker configuration and its builder.

use crate::circuit_breaker::CircuitBreakerError;
use crate::config::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Trip, recovery and probing thresholds for one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32,

    /// Consecutive probe successes that close a half-open circuit
    pub success_threshold: u32,

    /// Rolling failure rate in (0, 1] that opens the circuit
    pub failure_rate_threshold: f64,

    /// Outcomes kept for the rolling rates
    pub sliding_window_size: u32,

    /// Rates are ignored until the window holds this many outcomes
    pub minimum_request_threshold: u32,

    #[serde(with = "duration_ms")]
    pub open_timeout: Duration,

    /// Concurrent probes admitted while half-open
    pub half_open_max_requests: u32,

    /// Calls at least this slow count as slow; `None` disables slow-call tracking
    #[serde(with = "duration_ms::option")]
    pub slow_call_duration_threshold: Option<Duration>,

    /// Rolling slow-call rate in (0, 1] that opens the circuit
    pub slow_call_rate_threshold: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            failure_rate_threshold: 0.5,
            sliding_window_size: 20,
            minimum_request_threshold: 10,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
            slow_call_duration_threshold: None,
            slow_call_rate_threshold: 1.0,
        }
    }
}

fn ensure(condition: bool, message: &str) -> Result<(), CircuitBreakerError> {
    if condition {
        Ok(())
    } else {
        Err(CircuitBreakerError::InvalidConfig(message.to_string()))
    }
}

fn is_rate(value: f64) -> bool {
    value > 0.0 && value <= 1.0
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn validate(&self) -> Result<(), CircuitBreakerError> {
        ensure(self.failure_threshold > 0, "failure_threshold must be greater than 0")?;
        ensure(self.success_threshold > 0, "success_threshold must be greater than 0")?;
        ensure(!self.open_timeout.is_zero(), "open_timeout must be greater than 0")?;
        ensure(
            self.half_open_max_requests > 0,
            "half_open_max_requests must be greater than 0",
        )?;
        ensure(self.sliding_window_size > 0, "sliding_window_size must be greater than 0")?;
        ensure(
            is_rate(self.failure_rate_threshold),
            "failure_rate_threshold must be in (0.0, 1.0]",
        )?;
        ensure(
            is_rate(self.slow_call_rate_threshold),
            "slow_call_rate_threshold must be in (0.0, 1.0]",
        )
    }

    /// Settling deliveries: tolerate more noise, acks are cheap to redo
    pub fn for_broker_ack() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 3,
            failure_rate_threshold: 0.7,
            open_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }
}

/// Fluent builder starting from [`CircuitBreakerConfig::default`]
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn failure_rate_threshold(mut self, rate: f64) -> Self {
        self.config.failure_rate_threshold = rate;
        self
    }

    pub fn sliding_window_size(mut self, size: u32) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    pub fn minimum_request_threshold(mut self, threshold: u32) -> Self {
        self.config.minimum_request_threshold = threshold;
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    pub fn half_open_max_requests(mut self, max: u32) -> Self {
        self.config.half_open_max_requests = max;
        self
    }

    /// Turns on slow-call tracking
    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = Some(threshold);
        self
    }

    pub fn slow_call_rate_threshold(mut self, rate: f64) -> Self {
        self.config.slow_call_rate_threshold = rate;
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, CircuitBreakerError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.half_open_max_requests, 1);
        assert!(config.slow_call_duration_threshold.is_none());
        assert!(config.validate().is_ok());
        assert!(CircuitBreakerConfig::for_broker_ack().validate().is_ok());
    }

    #[test]
    fn test_builder_keeps_unset_defaults() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(10)
            .open_timeout(Duration::from_secs(1))
            .slow_call_duration_threshold(Duration::from_millis(250))
            .build()
            .unwrap();

        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.open_timeout, Duration::from_secs(1));
        assert_eq!(
            config.slow_call_duration_threshold,
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.failure_rate_threshold, 0.5);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(CircuitBreakerConfig::builder().failure_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder()
            .open_timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(CircuitBreakerConfig::builder()
            .failure_rate_threshold(1.5)
            .build()
            .is_err());
        assert!(CircuitBreakerConfig::builder()
            .slow_call_rate_threshold(0.0)
            .build()
            .is_err());
    }

    #[test]
    fn test_deserialize_durations_as_millis() {
        let config: CircuitBreakerConfig = serde_json::from_str(
            r#"{"failure_threshold": 3, "open_timeout": 1500, "slow_call_duration_threshold": 200}"#,
        )
        .unwrap();

        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.open_timeout, Duration::from_millis(1500));
        assert_eq!(
            config.slow_call_duration_threshold,
            Some(Duration::from_millis(200))
        );
        assert_eq!(config.success_threshold, 2);
    }
}
