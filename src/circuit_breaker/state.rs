//! Breaker states, transitions and the rolling outcome window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    /// Calls pass through and their outcomes are counted
    Closed,
    /// Calls fail fast until the open timeout elapses
    Open,
    /// A bounded number of probe calls decide between Closed and Open
    HalfOpen,
}

impl CircuitBreakerState {
    /// Gauge encoding: closed 0, open 1, half-open 2
    pub fn to_metric_value(&self) -> f64 {
        match self {
            CircuitBreakerState::Closed => 0.0,
            CircuitBreakerState::Open => 1.0,
            CircuitBreakerState::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitBreakerState::Closed => "closed",
            CircuitBreakerState::Open => "open",
            CircuitBreakerState::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CircuitBreakerState,
    pub to: CircuitBreakerState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Why a closed circuit should trip
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TripReason {
    ConsecutiveFailures(u32),
    FailureRate(f64),
    SlowCallRate(f64),
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripReason::ConsecutiveFailures(n) => write!(f, "{} consecutive failures", n),
            TripReason::FailureRate(rate) => {
                write!(f, "failure rate {:.0}% over sliding window", rate * 100.0)
            }
            TripReason::SlowCallRate(rate) => {
                write!(f, "slow-call rate {:.0}% over sliding window", rate * 100.0)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    failed: bool,
    slow: bool,
}

/// Last `capacity` call outcomes
#[derive(Debug, Clone)]
struct OutcomeWindow {
    outcomes: VecDeque<Outcome>,
    capacity: usize,
}

impl OutcomeWindow {
    fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1) as usize;
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, outcome: Outcome) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(outcome);
    }

    fn rate(&self, matches: impl Fn(&Outcome) -> bool) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let hits = self.outcomes.iter().filter(|o| matches(o)).count();
        hits as f64 / self.outcomes.len() as f64
    }
}

/// Everything guarded by a breaker's mutex
#[derive(Debug, Clone)]
pub struct StateData {
    pub state: CircuitBreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_state_change: DateTime<Utc>,
    /// Monotonic time of the last transition to Open
    pub opened_at: Option<Instant>,
    pub transition_count: u64,
    pub half_open_in_flight: u32,
    /// Set by a manual isolate; keeps the circuit open until reset
    pub isolated: bool,
    window: OutcomeWindow,
}

impl StateData {
    pub fn new(window_size: u32) -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_state_change: Utc::now(),
            opened_at: None,
            transition_count: 0,
            half_open_in_flight: 0,
            isolated: false,
            window: OutcomeWindow::new(window_size),
        }
    }

    pub fn record_success(&mut self, slow: bool) {
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        self.window.push(Outcome { failed: false, slow });
    }

    pub fn record_failure(&mut self, slow: bool) {
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        self.window.push(Outcome { failed: true, slow });
    }

    pub fn window_len(&self) -> usize {
        self.window.outcomes.len()
    }

    /// Share of failed calls in the window; with `count_slow` slow
    /// successes count as failures too
    pub fn failure_rate(&self, count_slow: bool) -> f64 {
        self.window.rate(|o| o.failed || (count_slow && o.slow))
    }

    pub fn slow_call_rate(&self) -> f64 {
        self.window.rate(|o| o.slow)
    }

    pub fn transition_to(&mut self, to: CircuitBreakerState, reason: String) -> StateTransition {
        let transition = StateTransition {
            from: self.state,
            to,
            timestamp: Utc::now(),
            reason,
        };

        self.state = to;
        self.last_state_change = transition.timestamp;
        self.transition_count += 1;
        self.half_open_in_flight = 0;
        self.consecutive_successes = 0;

        match to {
            CircuitBreakerState::Open => self.opened_at = Some(Instant::now()),
            CircuitBreakerState::HalfOpen => self.consecutive_failures = 0,
            CircuitBreakerState::Closed => {
                self.opened_at = None;
                self.isolated = false;
                self.clear_counters();
            }
        }

        transition
    }

    pub fn clear_counters(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
        self.window.outcomes.clear();
    }

    /// Open, not isolated, and open for at least `open_timeout`
    pub fn open_timeout_elapsed(&self, open_timeout: Duration) -> bool {
        self.state == CircuitBreakerState::Open
            && !self.isolated
            && self
                .opened_at
                .is_some_and(|opened_at| opened_at.elapsed() >= open_timeout)
    }
}
