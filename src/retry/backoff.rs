use crate::retry::{BackoffStrategy, RetryConfig};
use std::time::Duration;

/// Delay to wait after the `attempt`-th failure (1-based)
pub fn delay_for_attempt(config: &RetryConfig, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let base = match config.backoff {
        BackoffStrategy::Fixed => config.initial_delay,
        BackoffStrategy::Linear => config.initial_delay.saturating_mul(attempt),
        BackoffStrategy::Exponential => {
            // Cap the exponent; anything past 2^20 is beyond max_delay anyway
            let factor = 2_u32.saturating_pow((attempt - 1).min(20));
            config.initial_delay.saturating_mul(factor)
        }
    };

    let capped = base.min(config.max_delay);
    if config.jitter {
        capped.mul_f64(0.5 + fastrand::f64() * 0.5)
    } else {
        capped
    }
}
