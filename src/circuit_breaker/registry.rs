//! Per-pipeline registry of circuit breakers, one per destination.

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitBreakerStats,
};
use crate::telemetry::{NoopTelemetry, TelemetrySink};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Breakers keyed by destination, created lazily on first use.
///
/// A destination gets the registry's default config unless one was set
/// with [`configure`](Self::configure) before its breaker was created.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    overrides: DashMap<String, CircuitBreakerConfig>,
    default_config: CircuitBreakerConfig,
    telemetry: Arc<dyn TelemetrySink>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self::with_telemetry(default_config, Arc::new(NoopTelemetry))
    }

    pub fn with_telemetry(
        default_config: CircuitBreakerConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            overrides: DashMap::new(),
            default_config,
            telemetry,
        }
    }

    /// Use `config` for `destination`. Returns false if its breaker already
    /// exists, in which case the config applies only after [`evict`](Self::evict).
    pub fn configure(&self, destination: impl Into<String>, config: CircuitBreakerConfig) -> bool {
        let destination = destination.into();
        let applies = !self.breakers.contains_key(&destination);
        self.overrides.insert(destination, config);
        applies
    }

    /// The breaker guarding publishes to `destination`
    pub fn for_destination(&self, destination: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(destination, || self.default_config.clone())
    }

    /// The breaker guarding ack/reject calls for `destination`.
    ///
    /// Kept apart from the publish breaker so settlement failures on the
    /// consume side never open the publish circuit. Registered under
    /// [`settlement_key`] with [`CircuitBreakerConfig::for_broker_ack`]
    /// unless configured otherwise.
    pub fn for_settlement(&self, destination: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(&settlement_key(destination), CircuitBreakerConfig::for_broker_ack)
    }

    fn get_or_create(
        &self,
        key: &str,
        default_config: impl FnOnce() -> CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(key) {
            return breaker.value().clone();
        }

        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(key)
                    .map(|entry| entry.value().clone())
                    .unwrap_or_else(default_config);
                info!(breaker = key, "Creating circuit breaker");
                Arc::new(CircuitBreaker::with_telemetry(key, config, self.telemetry.clone()))
            })
            .clone()
    }

    /// Drop the breaker for `destination`; the next use starts a fresh one
    pub fn evict(&self, destination: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(destination).map(|(_, breaker)| breaker)
    }

    pub fn destinations(&self) -> Vec<String> {
        self.breakers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers.iter().map(|entry| entry.value().stats()).collect()
    }

    /// Force every breaker back to Closed
    pub fn reset_all(&self) {
        info!(breakers = self.breakers.len(), "Resetting all circuit breakers");
        self.breakers.iter().for_each(|entry| entry.value().reset());
    }

    pub fn get_state_counts(&self) -> StateCount {
        self.breakers
            .iter()
            .fold(StateCount::default(), |mut counts, entry| {
                match entry.value().state() {
                    CircuitBreakerState::Closed => counts.closed += 1,
                    CircuitBreakerState::Open => counts.open += 1,
                    CircuitBreakerState::HalfOpen => counts.half_open += 1,
                }
                counts
            })
    }

    /// Healthy while no destination is cut off
    pub fn health_check(&self) -> RegistryHealth {
        let counts = self.get_state_counts();
        let open_destinations = self
            .breakers
            .iter()
            .filter(|entry| entry.value().state() == CircuitBreakerState::Open)
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();

        RegistryHealth {
            healthy: open_destinations.is_empty(),
            counts,
            open_destinations,
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

/// Registry key of the settlement breaker for `destination`
pub fn settlement_key(destination: &str) -> String {
    format!("{}#ack", destination)
}

/// Count of breakers in each state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCount {
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

impl StateCount {
    pub fn total(&self) -> usize {
        self.closed + self.open + self.half_open
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryHealth {
    pub healthy: bool,
    pub counts: StateCount,
    pub open_destinations: Vec<String>,
}
