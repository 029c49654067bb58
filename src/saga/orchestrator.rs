//! Executes saga definitions with checkpointing and compensation.

use crate::saga::definition::SagaDefinition;
use crate::saga::error::{SagaError, SagaResult, StepFailure};
use crate::saga::persistence::{CompletedStep, PersistenceError, SagaCheckpoint, SagaPersistence};
use crate::saga::state::SagaState;
use crate::saga::step::SagaData;
use crate::telemetry::{NoopTelemetry, TelemetrySink};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of running or resuming a saga
#[derive(Debug, Clone)]
pub struct SagaExecution<D> {
    pub saga_id: String,
    pub state: SagaState,
    pub data: D,
    /// The forward failure that triggered compensation, if any
    pub failure: Option<StepFailure>,
    pub compensation_errors: Vec<StepFailure>,
    /// Names of steps still completed (not compensated)
    pub completed_steps: Vec<String>,
}

impl<D> SagaExecution<D> {
    pub fn is_completed(&self) -> bool {
        self.state == SagaState::Completed
    }

    /// Data of a completed saga, or the error explaining why it did not complete
    pub fn into_result(self) -> SagaResult<D> {
        match self.state {
            SagaState::Completed => Ok(self.data),
            SagaState::Aborted => Err(SagaError::Aborted(self.saga_id)),
            SagaState::Failed => Err(SagaError::CompensationFailed {
                original: self.failure,
                compensation_errors: self.compensation_errors,
            }),
            _ => match self.failure {
                Some(failure) => Err(SagaError::StepFailed {
                    step: failure.step,
                    source: failure.error.into(),
                }),
                None => Err(SagaError::Aborted(self.saga_id)),
            },
        }
    }
}

/// Holds a saga id in the running set until dropped
struct RunningGuard {
    running: Arc<DashMap<String, ()>>,
    saga_id: String,
}

impl RunningGuard {
    fn acquire(running: &Arc<DashMap<String, ()>>, saga_id: &str) -> SagaResult<Self> {
        match running.entry(saga_id.to_string()) {
            Entry::Occupied(_) => Err(SagaError::AlreadyRunning(saga_id.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(());
                Ok(Self {
                    running: running.clone(),
                    saga_id: saga_id.to_string(),
                })
            }
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.saga_id);
    }
}

/// Mutable state of one saga while it runs
struct Run<D> {
    checkpoint: SagaCheckpoint,
    data: D,
}

/// Runs sagas of one definition.
///
/// Forward steps run in order with a checkpoint after each. On a step
/// failure (or cancellation between steps) completed steps are compensated
/// in reverse order, checkpointing after each compensation. A failing
/// compensation does not stop the remaining ones; all errors are reported
/// together and the saga ends `Failed`.
pub struct SagaOrchestrator<D: SagaData> {
    definition: Arc<SagaDefinition<D>>,
    persistence: Arc<dyn SagaPersistence>,
    telemetry: Arc<dyn TelemetrySink>,
    running: Arc<DashMap<String, ()>>,
}

impl<D: SagaData> Clone for SagaOrchestrator<D> {
    fn clone(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            persistence: self.persistence.clone(),
            telemetry: self.telemetry.clone(),
            running: self.running.clone(),
        }
    }
}

impl<D: SagaData> SagaOrchestrator<D> {
    pub fn new(definition: SagaDefinition<D>, persistence: Arc<dyn SagaPersistence>) -> Self {
        Self::with_telemetry(definition, persistence, Arc::new(NoopTelemetry))
    }

    pub fn with_telemetry(
        definition: SagaDefinition<D>,
        persistence: Arc<dyn SagaPersistence>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            definition: Arc::new(definition),
            persistence,
            telemetry,
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn definition(&self) -> &SagaDefinition<D> {
        &self.definition
    }

    /// Whether the saga id is executing in this process
    pub fn is_running(&self, saga_id: &str) -> bool {
        self.running.contains_key(saga_id)
    }

    /// Start a new saga with `data`
    pub async fn execute(&self, saga_id: impl Into<String>, data: D) -> SagaResult<SagaExecution<D>> {
        self.execute_with_cancel(saga_id, data, &CancellationToken::new())
            .await
    }

    /// Start a new saga; `cancel` is checked before each step
    pub async fn execute_with_cancel(
        &self,
        saga_id: impl Into<String>,
        data: D,
        cancel: &CancellationToken,
    ) -> SagaResult<SagaExecution<D>> {
        let saga_id = saga_id.into();
        let _guard = RunningGuard::acquire(&self.running, &saga_id)?;

        let now = Utc::now();
        let mut run = Run {
            checkpoint: SagaCheckpoint {
                saga_id: saga_id.clone(),
                saga_name: self.definition.name().to_string(),
                step_names: self.definition.step_names(),
                state: SagaState::NotStarted,
                next_step: 0,
                completed_steps: Vec::new(),
                data: serde_json::Value::Null,
                failure: None,
                compensation_errors: Vec::new(),
                cancelled: false,
                version: 0,
                created_at: now,
                updated_at: now,
            },
            data,
        };

        info!(
            saga_id = %saga_id,
            saga = %self.definition.name(),
            steps = self.definition.len(),
            "Starting saga"
        );
        self.telemetry
            .counter("saga.started", &[("saga", self.definition.name())]);

        self.transition(&mut run, SagaState::Running).await?;
        self.drive(run, cancel).await
    }

    /// Continue a saga from its last checkpoint
    pub async fn resume(&self, saga_id: &str) -> SagaResult<SagaExecution<D>> {
        self.resume_with_cancel(saga_id, &CancellationToken::new())
            .await
    }

    pub async fn resume_with_cancel(
        &self,
        saga_id: &str,
        cancel: &CancellationToken,
    ) -> SagaResult<SagaExecution<D>> {
        let _guard = RunningGuard::acquire(&self.running, saga_id)?;

        let checkpoint = self.persistence.load_checkpoint(saga_id).await?;
        self.check_definition(&checkpoint)?;

        let data: D = serde_json::from_value(checkpoint.data.clone())
            .map_err(PersistenceError::from)?;
        let mut run = Run { checkpoint, data };

        if run.checkpoint.state.is_terminal() {
            debug!(saga_id, state = %run.checkpoint.state, "Saga already finished");
            return Ok(self.execution(run));
        }

        info!(
            saga_id,
            state = %run.checkpoint.state,
            next_step = run.checkpoint.next_step,
            "Resuming saga"
        );
        if run.checkpoint.state == SagaState::NotStarted {
            self.transition(&mut run, SagaState::Running).await?;
        }
        self.drive(run, cancel).await
    }

    fn check_definition(&self, checkpoint: &SagaCheckpoint) -> SagaResult<()> {
        if checkpoint.saga_name != self.definition.name() {
            return Err(SagaError::DefinitionMismatch(format!(
                "checkpoint '{}' belongs to saga '{}', not '{}'",
                checkpoint.saga_id,
                checkpoint.saga_name,
                self.definition.name()
            )));
        }
        let step_names = self.definition.step_names();
        if checkpoint.step_names != step_names {
            return Err(SagaError::DefinitionMismatch(format!(
                "checkpoint '{}' has steps {:?}, definition has {:?}",
                checkpoint.saga_id, checkpoint.step_names, step_names
            )));
        }
        Ok(())
    }

    async fn drive(&self, mut run: Run<D>, cancel: &CancellationToken) -> SagaResult<SagaExecution<D>> {
        if run.checkpoint.state == SagaState::Running {
            self.run_forward(&mut run, cancel).await?;
        }
        if run.checkpoint.state == SagaState::Compensating {
            self.compensate(&mut run).await?;
        }

        let state = run.checkpoint.state;
        self.telemetry.counter(
            "saga.finished",
            &[("saga", self.definition.name()), ("outcome", state.as_str())],
        );

        let execution = self.execution(run);
        if state == SagaState::Failed {
            return Err(SagaError::CompensationFailed {
                original: execution.failure,
                compensation_errors: execution.compensation_errors,
            });
        }
        Ok(execution)
    }

    async fn run_forward(&self, run: &mut Run<D>, cancel: &CancellationToken) -> SagaResult<()> {
        let saga_id = run.checkpoint.saga_id.clone();
        let steps = self.definition.steps();

        while run.checkpoint.next_step < steps.len() {
            if cancel.is_cancelled() {
                warn!(saga_id = %saga_id, next_step = run.checkpoint.next_step, "Saga cancelled");
                run.checkpoint.cancelled = true;
                return self.transition(run, SagaState::Compensating).await;
            }

            let index = run.checkpoint.next_step;
            let step = &steps[index];
            let start = Instant::now();
            let result = step.execute(&mut run.data).await;
            self.telemetry.histogram(
                "saga.step.duration",
                start.elapsed().as_secs_f64(),
                &[("saga", self.definition.name()), ("step", step.name())],
            );

            match result {
                Ok(()) => {
                    debug!(saga_id = %saga_id, step = step.name(), "Saga step completed");
                    run.checkpoint.completed_steps.push(CompletedStep {
                        index,
                        name: step.name().to_string(),
                        completed_at: Utc::now(),
                    });
                    run.checkpoint.next_step = index + 1;
                    self.save(run).await?;
                }
                Err(e) => {
                    warn!(
                        saga_id = %saga_id,
                        step = step.name(),
                        error = %e,
                        "Saga step failed, compensating"
                    );
                    run.checkpoint.failure = Some(StepFailure {
                        step: step.name().to_string(),
                        error: e.to_string(),
                    });
                    return self.transition(run, SagaState::Compensating).await;
                }
            }
        }

        info!(saga_id = %saga_id, "Saga completed");
        self.transition(run, SagaState::Completed).await
    }

    async fn compensate(&self, run: &mut Run<D>) -> SagaResult<()> {
        let saga_id = run.checkpoint.saga_id.clone();
        let steps = self.definition.steps();

        while let Some(completed) = run.checkpoint.completed_steps.last().cloned() {
            let step = &steps[completed.index];
            match step.compensate(&mut run.data).await {
                Ok(()) => {
                    debug!(saga_id = %saga_id, step = step.name(), "Step compensated");
                }
                Err(e) => {
                    error!(
                        saga_id = %saga_id,
                        step = step.name(),
                        error = %e,
                        "Compensation failed, continuing with remaining steps"
                    );
                    run.checkpoint.compensation_errors.push(StepFailure {
                        step: step.name().to_string(),
                        error: e.to_string(),
                    });
                }
            }
            self.telemetry.counter(
                "saga.compensation.count",
                &[("saga", self.definition.name()), ("step", step.name())],
            );

            run.checkpoint.completed_steps.pop();
            self.save(run).await?;
        }

        let outcome = if !run.checkpoint.compensation_errors.is_empty() {
            SagaState::Failed
        } else if run.checkpoint.cancelled {
            SagaState::Aborted
        } else {
            SagaState::Compensated
        };
        info!(saga_id = %saga_id, outcome = %outcome, "Saga compensation finished");
        self.transition(run, outcome).await
    }

    async fn transition(&self, run: &mut Run<D>, target: SagaState) -> SagaResult<()> {
        debug_assert!(
            run.checkpoint.state.can_transition_to(target),
            "invalid saga transition"
        );
        run.checkpoint.state = target;
        self.save(run).await
    }

    async fn save(&self, run: &mut Run<D>) -> SagaResult<()> {
        run.checkpoint.data = serde_json::to_value(&run.data).map_err(PersistenceError::from)?;
        run.checkpoint.updated_at = Utc::now();

        let expected = run.checkpoint.version;
        let version = self
            .persistence
            .save_checkpoint(&run.checkpoint, expected)
            .await?;
        run.checkpoint.version = version;
        Ok(())
    }

    fn execution(&self, run: Run<D>) -> SagaExecution<D> {
        SagaExecution {
            saga_id: run.checkpoint.saga_id,
            state: run.checkpoint.state,
            data: run.data,
            failure: run.checkpoint.failure,
            compensation_errors: run.checkpoint.compensation_errors,
            completed_steps: run
                .checkpoint
                .completed_steps
                .into_iter()
                .map(|step| step.name)
                .collect(),
        }
    }
}
