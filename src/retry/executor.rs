use crate::error::PipelineError;
use crate::retry::{delay_for_attempt, RetryConfig};
use crate::telemetry::{NoopTelemetry, TelemetrySink};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Decides whether a failure is worth another attempt
pub trait TransientClassifier<E: ?Sized>: Send + Sync {
    fn is_transient(&self, error: &E) -> bool;
}

impl<E: ?Sized, F> TransientClassifier<E> for F
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn is_transient(&self, error: &E) -> bool {
        self(error)
    }
}

/// Retries only [`PipelineError::TransientTransport`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineErrorClassifier;

impl TransientClassifier<PipelineError> for PipelineErrorClassifier {
    fn is_transient(&self, error: &PipelineError) -> bool {
        error.is_transient()
    }
}

/// Runs operations under a [`RetryConfig`]
#[derive(Clone)]
pub struct RetryExecutor {
    name: String,
    config: RetryConfig,
    telemetry: Arc<dyn TelemetrySink>,
}

impl RetryExecutor {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self::with_telemetry(name, config, Arc::new(NoopTelemetry))
    }

    pub fn with_telemetry(
        name: impl Into<String>,
        config: RetryConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            telemetry,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay to wait after the `attempt`-th failure (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        delay_for_attempt(&self.config, attempt)
    }

    /// Run `op`, retrying transient [`PipelineError`]s
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        self.execute_with(&PipelineErrorClassifier, op).await
    }

    /// Run `op`, retrying failures the classifier marks as transient.
    ///
    /// Non-transient failures and the failure of the last attempt are
    /// returned as-is.
    pub async fn execute_with<C, F, Fut, T, E>(&self, classifier: &C, mut op: F) -> Result<T, E>
    where
        C: TransientClassifier<E> + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(name = %self.name, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if !classifier.is_transient(&err) {
                        debug!(name = %self.name, attempt, error = %err, "Non-transient failure, not retrying");
                        return Err(err);
                    }

                    if attempt >= self.config.max_attempts {
                        warn!(
                            name = %self.name,
                            attempts = attempt,
                            error = %err,
                            "Retry attempts exhausted"
                        );
                        self.telemetry
                            .counter("retry.exhausted", &[("name", self.name.as_str())]);
                        return Err(err);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        name = %self.name,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    self.telemetry
                        .counter("retry.attempts", &[("name", self.name.as_str())]);

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}
