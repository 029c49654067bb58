//! Compensating multi-step workflows (sagas).
//!
//! A [`SagaDefinition`] is an ordered list of [`SagaStep`]s. The
//! [`SagaOrchestrator`] runs the steps forward, writing a [`SagaCheckpoint`]
//! through [`SagaPersistence`] after every step. When a step fails, or the
//! saga is cancelled between steps, the completed steps are compensated in
//! reverse order.
//!
//! ```text
//! NotStarted ─▶ Running ─┬─▶ Completed
//!                        └─▶ Compensating ─┬─▶ Compensated
//!                                          ├─▶ Aborted   (cancelled)
//!                                          └─▶ Failed    (compensation error)
//! ```

mod definition;
mod error;
mod orchestrator;
mod persistence;
mod state;
mod step;

pub use definition::{SagaDefinition, SagaDefinitionBuilder};
pub use error::{SagaError, SagaResult, StepFailure};
pub use orchestrator::{SagaExecution, SagaOrchestrator};
pub use persistence::{
    CompletedStep, InMemorySagaPersistence, PersistenceError, PersistenceResult, SagaCheckpoint,
    SagaPersistence,
};
pub use state::SagaState;
pub use step::{SagaData, SagaStep, StepError, StepResult};
