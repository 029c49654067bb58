//! The breaker itself: admission, outcome recording and transitions.

use crate::circuit_breaker::state::TripReason;
use crate::circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerState, StateData, StateTransition,
};
use crate::telemetry::{NoopTelemetry, TelemetrySink};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events published by a circuit breaker
#[derive(Debug, Clone)]
pub enum CircuitBreakerEvent {
    /// The breaker moved between states
    StateChanged {
        name: String,
        transition: StateTransition,
    },
    /// A call was rejected without being attempted
    CallRejected {
        name: String,
        state: CircuitBreakerState,
    },
}

/// A thread-safe, async circuit breaker
#[derive(Clone)]
pub struct CircuitBreaker {
    /// Unique name for this circuit breaker
    name: String,
    /// Configuration
    config: CircuitBreakerConfig,
    /// Internal state, one critical section per breaker
    state: Arc<Mutex<StateData>>,
    events: broadcast::Sender<CircuitBreakerEvent>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state.lock().state)
            .finish()
    }
}

/// Admission granted to a single call, tagged with the state generation
/// (transition count) it was granted in
#[derive(Clone, Copy)]
enum Admission {
    Closed(u64),
    Probe(u64),
}

impl Admission {
    fn generation(self) -> u64 {
        match self {
            Admission::Closed(generation) | Admission::Probe(generation) => generation,
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_telemetry(name, config, Arc::new(NoopTelemetry))
    }

    /// Create a new circuit breaker that reports to a telemetry sink
    pub fn with_telemetry(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let name = name.into();
        info!(
            name = %name,
            config = ?config,
            "Creating new circuit breaker"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(StateData::new(config.sliding_window_size))),
            name,
            config,
            events,
            telemetry,
        }
    }

    /// Get the name of this circuit breaker
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state, applying a pending Open -> HalfOpen transition
    pub fn state(&self) -> CircuitBreakerState {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);
        state.state
    }

    /// Get the current configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Subscribe to state transitions and rejections
    pub fn subscribe_events(&self) -> broadcast::Receiver<CircuitBreakerEvent> {
        self.events.subscribe()
    }

    /// Execute an async operation protected by the circuit breaker.
    ///
    /// When the circuit is open the operation is never invoked and the
    /// error is built from [`CircuitBreakerError::Open`]. Any `Err` returned
    /// by the operation counts as a failure and is handed back unchanged.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitBreakerError>,
    {
        let admission = self.admit().map_err(E::from)?;
        let generation = admission.generation();
        let mut guard = ProbeGuard {
            breaker: self,
            generation,
            armed: matches!(admission, Admission::Probe(_)),
        };

        let start = Instant::now();
        let result = f().await;
        let duration = start.elapsed();

        self.telemetry.histogram(
            "circuit_breaker.call.duration",
            duration.as_secs_f64(),
            &[("name", self.name.as_str())],
        );

        let slow = self
            .config
            .slow_call_duration_threshold
            .map(|threshold| duration >= threshold)
            .unwrap_or(false);

        // Outcome recording releases the probe slot itself
        guard.armed = false;
        match result {
            Ok(value) => {
                self.on_success(generation, slow);
                self.telemetry
                    .counter("circuit_breaker.calls", &[("name", self.name.as_str()), ("outcome", "success")]);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(generation, slow);
                self.telemetry
                    .counter("circuit_breaker.calls", &[("name", self.name.as_str()), ("outcome", "failure")]);
                Err(err)
            }
        }
    }

    /// Execute an async operation with a fallback used when the circuit is open
    pub async fn call_with_fallback<F, Fut, FB, FutB, T, E>(&self, f: F, fallback: FB) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> FutB,
        FutB: Future<Output = T>,
        E: From<CircuitBreakerError>,
    {
        if !self.is_call_permitted() {
            debug!(
                name = %self.name,
                "Circuit breaker open, using fallback"
            );
            return Ok(fallback().await);
        }
        self.call(f).await
    }

    /// Whether a call made now would be attempted
    pub fn is_call_permitted(&self) -> bool {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);
        match state.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => false,
            CircuitBreakerState::HalfOpen => {
                state.half_open_in_flight < self.config.half_open_max_requests
            }
        }
    }

    fn maybe_half_open(&self, state: &mut StateData) {
        if state.open_timeout_elapsed(self.config.open_timeout) {
            let transition = state.transition_to(
                CircuitBreakerState::HalfOpen,
                "Open timeout elapsed, testing recovery".to_string(),
            );
            self.log_transition(transition);
        }
    }

    /// Check state and reserve a slot for the call
    fn admit(&self) -> Result<Admission, CircuitBreakerError> {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);

        match state.state {
            CircuitBreakerState::Closed => Ok(Admission::Closed(state.transition_count)),
            CircuitBreakerState::Open => Err(self.reject(state.state)),
            CircuitBreakerState::HalfOpen => {
                if state.half_open_in_flight >= self.config.half_open_max_requests {
                    Err(self.reject(state.state))
                } else {
                    state.half_open_in_flight += 1;
                    Ok(Admission::Probe(state.transition_count))
                }
            }
        }
    }

    fn reject(&self, state: CircuitBreakerState) -> CircuitBreakerError {
        debug!(name = %self.name, state = %state, "Circuit breaker rejected call");
        self.telemetry
            .counter("circuit_breaker.calls", &[("name", self.name.as_str()), ("outcome", "rejected")]);
        let _ = self.events.send(CircuitBreakerEvent::CallRejected {
            name: self.name.clone(),
            state,
        });
        CircuitBreakerError::Open(self.name.clone())
    }

    /// Outcomes of calls admitted before the last transition describe a
    /// state that no longer exists and are dropped
    fn is_stale(&self, state: &StateData, generation: u64) -> bool {
        if state.transition_count == generation {
            return false;
        }
        debug!(
            name = %self.name,
            current_state = %state.state,
            "Ignoring outcome of call admitted before the last transition"
        );
        true
    }

    /// Handle successful operation
    fn on_success(&self, generation: u64, slow: bool) {
        let mut state = self.state.lock();
        if self.is_stale(&state, generation) {
            return;
        }
        state.record_success(slow);
        if state.state == CircuitBreakerState::HalfOpen {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }

        debug!(
            name = %self.name,
            current_state = %state.state,
            consecutive_successes = state.consecutive_successes,
            slow,
            "Operation succeeded"
        );

        match state.state {
            CircuitBreakerState::HalfOpen
                if state.consecutive_successes >= self.config.success_threshold =>
            {
                let reason = format!(
                    "Recovery successful ({} consecutive successes)",
                    state.consecutive_successes
                );
                let transition = state.transition_to(CircuitBreakerState::Closed, reason);
                self.log_transition(transition);
            }
            CircuitBreakerState::Closed => {
                // Slow successes can still trip the rate checks
                if let Some(reason) = self.trip_reason(&state) {
                    let transition = state.transition_to(CircuitBreakerState::Open, reason.to_string());
                    self.log_transition(transition);
                }
            }
            _ => {}
        }
    }

    /// Handle failed operation
    fn on_failure(&self, generation: u64, slow: bool) {
        let mut state = self.state.lock();
        if self.is_stale(&state, generation) {
            return;
        }
        state.record_failure(slow);

        warn!(
            name = %self.name,
            current_state = %state.state,
            consecutive_failures = state.consecutive_failures,
            "Operation failed"
        );

        match state.state {
            CircuitBreakerState::Closed => {
                if let Some(reason) = self.trip_reason(&state) {
                    let transition = state.transition_to(CircuitBreakerState::Open, reason.to_string());
                    self.log_transition(transition);
                }
            }
            CircuitBreakerState::HalfOpen => {
                // Any failure in half-open state reopens the circuit
                let transition = state
                    .transition_to(CircuitBreakerState::Open, "Recovery probe failed".to_string());
                self.log_transition(transition);
            }
            CircuitBreakerState::Open => {}
        }
    }

    fn trip_reason(&self, state: &StateData) -> Option<TripReason> {
        if state.consecutive_failures >= self.config.failure_threshold {
            return Some(TripReason::ConsecutiveFailures(state.consecutive_failures));
        }

        if state.window_len() < self.config.minimum_request_threshold as usize {
            return None;
        }

        let slow_tracking = self.config.slow_call_duration_threshold.is_some();
        let failure_rate = state.failure_rate(slow_tracking);
        if failure_rate >= self.config.failure_rate_threshold {
            return Some(TripReason::FailureRate(failure_rate));
        }

        if slow_tracking {
            let slow_rate = state.slow_call_rate();
            if slow_rate >= self.config.slow_call_rate_threshold {
                return Some(TripReason::SlowCallRate(slow_rate));
            }
        }

        None
    }

    /// Release a probe slot for a call that never reported an outcome
    fn release_probe(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.state == CircuitBreakerState::HalfOpen && state.transition_count == generation {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Log and publish a state transition
    fn log_transition(&self, transition: StateTransition) {
        info!(
            name = %self.name,
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            "Circuit breaker state transition"
        );

        self.telemetry.histogram(
            "circuit_breaker.state",
            transition.to.to_metric_value(),
            &[("name", self.name.as_str())],
        );
        let from_state = transition.from.to_string();
        let to_state = transition.to.to_string();
        self.telemetry.counter(
            "circuit_breaker.transitions",
            &[
                ("name", self.name.as_str()),
                ("from_state", from_state.as_str()),
                ("to_state", to_state.as_str()),
            ],
        );

        let _ = self.events.send(CircuitBreakerEvent::StateChanged {
            name: self.name.clone(),
            transition,
        });
    }

    /// Get statistics for this circuit breaker
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            failure_rate: state.failure_rate(self.config.slow_call_duration_threshold.is_some()),
            slow_call_rate: state.slow_call_rate(),
            transition_count: state.transition_count,
            last_state_change: state.last_state_change,
            isolated: state.isolated,
        }
    }

    /// Force the circuit breaker to closed state and clear all counters
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.state != CircuitBreakerState::Closed {
            let transition =
                state.transition_to(CircuitBreakerState::Closed, "Manual reset".to_string());
            self.log_transition(transition);
        } else {
            state.clear_counters();
        }
    }

    /// Force the circuit breaker open until the next [`reset`](Self::reset)
    pub fn isolate(&self) {
        let mut state = self.state.lock();
        if state.state != CircuitBreakerState::Open {
            let transition =
                state.transition_to(CircuitBreakerState::Open, "Manually isolated".to_string());
            self.log_transition(transition);
        }
        state.isolated = true;
    }
}

/// Gives a half-open probe slot back if the call future is dropped mid-flight
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe(self.generation);
        }
    }
}

/// Statistics for a circuit breaker
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitBreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub failure_rate: f64,
    pub slow_call_rate: f64,
    pub transition_count: u64,
    pub last_state_change: chrono::DateTime<chrono::Utc>,
    pub isolated: bool,
}
