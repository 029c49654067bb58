use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error returned by a step; any error type works
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

pub type StepResult = std::result::Result<(), StepError>;

/// Saga data carried between steps and snapshotted into checkpoints
pub trait SagaData: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> SagaData for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// One step of a saga: a forward action plus the action that undoes it.
///
/// # Idempotency
///
/// Both `execute` and `compensate` must be idempotent. A checkpoint is
/// written after each step, so a process that crashes between a step's side
/// effect and its checkpoint re-runs that step on resume. Compensation has
/// the same window.
#[async_trait]
pub trait SagaStep<D: SagaData>: Send + Sync {
    /// Unique name within the saga, recorded in checkpoints
    fn name(&self) -> &str;

    /// Forward action. An error stops the saga and compensates every
    /// previously completed step.
    async fn execute(&self, data: &mut D) -> StepResult;

    /// Undo a completed `execute`. Only called for steps that completed.
    async fn compensate(&self, data: &mut D) -> StepResult;
}
