use crate::backpressure::{BackpressureConfig, ThrottlePolicy, TokenBucket};
use crate::error::{PipelineError, Result};
use crate::telemetry::{NoopTelemetry, TelemetrySink};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Bounds concurrent in-flight operations and, optionally, their rate
pub struct BackpressureController {
    name: String,
    config: BackpressureConfig,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    rate_limiter: Option<TokenBucket>,
    telemetry: Arc<dyn TelemetrySink>,
}

/// Held for the lifetime of one admitted operation; releases its slot on drop
#[derive(Debug)]
pub struct BackpressurePermit {
    _permit: OwnedSemaphorePermit,
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackpressureSnapshot {
    pub in_flight: usize,
    pub waiting: usize,
    pub max_inflight: usize,
}

/// Decrements the waiter count however the wait ends
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BackpressureController {
    pub fn new(name: impl Into<String>, config: BackpressureConfig) -> Self {
        Self::with_telemetry(name, config, Arc::new(NoopTelemetry))
    }

    pub fn with_telemetry(
        name: impl Into<String>,
        config: BackpressureConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let name = name.into();
        info!(
            name = %name,
            max_inflight = config.max_inflight,
            policy = %config.policy,
            "Creating backpressure controller"
        );

        let rate_limiter = config
            .rate_limit
            .as_ref()
            .map(|rate| TokenBucket::new(rate.permits_per_second, rate.burst));

        Self {
            semaphore: Arc::new(Semaphore::new(config.max_inflight)),
            waiting: AtomicUsize::new(0),
            rate_limiter,
            name,
            config,
            telemetry,
        }
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Admit without ever blocking
    pub fn try_acquire(&self) -> Result<BackpressurePermit> {
        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(self.reject("max in-flight reached"));
            }
            Err(TryAcquireError::Closed) => return Err(PipelineError::ShutDown),
        };

        if let Some(bucket) = &self.rate_limiter {
            if bucket.try_take().is_err() {
                return Err(self.reject("rate limit exceeded"));
            }
        }

        Ok(BackpressurePermit { _permit: permit })
    }

    /// Admit according to the configured throttle policy
    pub async fn acquire(&self) -> Result<BackpressurePermit> {
        match self.config.policy {
            ThrottlePolicy::RejectImmediately => self.try_acquire(),
            ThrottlePolicy::WaitThenRetry => {
                self.waiting.fetch_add(1, Ordering::SeqCst);
                let _guard = WaitingGuard(&self.waiting);

                match tokio::time::timeout(self.config.max_wait, self.wait_for_slot()).await {
                    Ok(result) => result,
                    Err(_) => Err(self.reject("timed out waiting for a slot")),
                }
            }
            ThrottlePolicy::BoundedQueue => {
                let previous = self.waiting.fetch_add(1, Ordering::SeqCst);
                let _guard = WaitingGuard(&self.waiting);

                if previous >= self.config.queue_capacity {
                    return Err(self.reject("wait queue is full"));
                }
                self.wait_for_slot().await
            }
        }
    }

    async fn wait_for_slot(&self) -> Result<BackpressurePermit> {
        let start = Instant::now();
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::ShutDown)?;

        if let Some(bucket) = &self.rate_limiter {
            while let Err(wait) = bucket.try_take() {
                tokio::time::sleep(wait).await;
            }
        }

        let waited = start.elapsed();
        self.telemetry.histogram(
            "backpressure.wait.duration",
            waited.as_secs_f64(),
            &[("name", self.name.as_str())],
        );
        debug!(name = %self.name, waited_ms = waited.as_millis() as u64, "Admitted after waiting");

        Ok(BackpressurePermit { _permit: permit })
    }

    fn reject(&self, reason: &str) -> PipelineError {
        let policy = self.config.policy.to_string();
        warn!(name = %self.name, policy = %policy, reason, "Backpressure rejected operation");
        self.telemetry.counter(
            "backpressure.rejected",
            &[("name", self.name.as_str()), ("policy", policy.as_str())],
        );
        PipelineError::BackpressureRejected(format!("{}: {}", self.name, reason))
    }

    /// Operations currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.config
            .max_inflight
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Callers currently waiting for a permit
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BackpressureSnapshot {
        BackpressureSnapshot {
            in_flight: self.in_flight(),
            waiting: self.waiting(),
            max_inflight: self.config.max_inflight,
        }
    }

    /// Stop admitting; current waiters fail with `ShutDown`
    pub fn close(&self) {
        info!(name = %self.name, "Closing backpressure controller");
        self.semaphore.close();
    }
}

impl std::fmt::Debug for BackpressureController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureController")
            .field("name", &self.name)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::RateLimitConfig;
    use futures::FutureExt;
    use std::time::Duration;

    fn controller(max_inflight: usize, policy: ThrottlePolicy) -> BackpressureController {
        BackpressureController::new(
            "test",
            BackpressureConfig {
                max_inflight,
                policy,
                max_wait: Duration::from_millis(100),
                queue_capacity: 1,
                rate_limit: None,
            },
        )
    }

    #[tokio::test]
    async fn test_reject_immediately_fails_synchronously_when_full() {
        let controller = controller(2, ThrottlePolicy::RejectImmediately);
        let _a = controller.try_acquire().unwrap();
        let _b = controller.try_acquire().unwrap();
        assert_eq!(controller.in_flight(), 2);

        let result = controller
            .acquire()
            .now_or_never()
            .expect("acquire must not block under reject_immediately");
        assert!(matches!(result, Err(PipelineError::BackpressureRejected(_))));
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let controller = controller(1, ThrottlePolicy::RejectImmediately);
        {
            let _permit = controller.try_acquire().unwrap();
            assert!(controller.try_acquire().is_err());
        }
        assert_eq!(controller.in_flight(), 0);
        assert!(controller.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_then_retry_times_out() {
        let controller = controller(1, ThrottlePolicy::WaitThenRetry);
        let _held = controller.try_acquire().unwrap();

        let result = controller.acquire().await;
        assert!(matches!(result, Err(PipelineError::BackpressureRejected(_))));
        assert_eq!(controller.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_then_retry_admits_when_slot_frees() {
        let controller = Arc::new(controller(1, ThrottlePolicy::WaitThenRetry));
        let held = controller.try_acquire().unwrap();

        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.waiting(), 1);

        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_bounded_queue_rejects_extra_waiters() {
        let controller = Arc::new(controller(1, ThrottlePolicy::BoundedQueue));
        let held = controller.try_acquire().unwrap();

        let first = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.acquire().await.map(|_| ()) })
        };
        while controller.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        let second = controller.acquire().await;
        assert!(matches!(second, Err(PipelineError::BackpressureRejected(_))));

        drop(held);
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_close_fails_waiters_with_shutdown() {
        let controller = controller(1, ThrottlePolicy::RejectImmediately);
        controller.close();
        assert!(matches!(controller.try_acquire(), Err(PipelineError::ShutDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_rejects_over_burst() {
        let controller = BackpressureController::new(
            "rate",
            BackpressureConfig {
                max_inflight: 10,
                policy: ThrottlePolicy::RejectImmediately,
                rate_limit: Some(RateLimitConfig {
                    permits_per_second: 1.0,
                    burst: 2,
                }),
                ..Default::default()
            },
        );

        assert!(controller.try_acquire().is_ok());
        assert!(controller.try_acquire().is_ok());
        assert!(controller.try_acquire().is_err());
        // The rejected call must not keep a slot
        assert_eq!(controller.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let controller = controller(3, ThrottlePolicy::RejectImmediately);
        let _permit = controller.try_acquire().unwrap();
        assert_eq!(
            controller.snapshot(),
            BackpressureSnapshot {
                in_flight: 1,
                waiting: 0,
                max_inflight: 3
            }
        );
    }
}
