use crate::saga::persistence::PersistenceError;
use crate::saga::step::StepError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A step or compensation that failed, as recorded in a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: String,
    pub error: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}': {}", self.step, self.error)
    }
}

/// Saga error types
#[derive(Error, Debug)]
pub enum SagaError {
    /// A forward step failed; completed steps were compensated
    #[error("Saga step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: StepError,
    },

    /// One or more compensations failed; the saga is left `Failed`
    #[error(
        "Compensation failed ({} error(s)) after {}",
        .compensation_errors.len(),
        describe_trigger(.original)
    )]
    CompensationFailed {
        /// The failure that triggered compensation; `None` when cancelled
        original: Option<StepFailure>,
        compensation_errors: Vec<StepFailure>,
    },

    /// The saga was cancelled and compensated
    #[error("Saga '{0}' was aborted")]
    Aborted(String),

    #[error("Saga persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// The same saga id is already executing in this process
    #[error("Saga '{0}' is already running")]
    AlreadyRunning(String),

    /// A checkpoint does not match the definition trying to resume it
    #[error("Saga definition mismatch: {0}")]
    DefinitionMismatch(String),

    /// The definition itself is unusable
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),
}

impl SagaError {
    /// Get error code string
    pub fn error_code(&self) -> &str {
        match self {
            SagaError::StepFailed { .. } => "SAGA_STEP_FAILED",
            SagaError::CompensationFailed { .. } => "SAGA_COMPENSATION_FAILED",
            SagaError::Aborted(_) => "SAGA_ABORTED",
            SagaError::Persistence(_) => "SAGA_PERSISTENCE_ERROR",
            SagaError::AlreadyRunning(_) => "SAGA_ALREADY_RUNNING",
            SagaError::DefinitionMismatch(_) => "SAGA_DEFINITION_MISMATCH",
            SagaError::InvalidDefinition(_) => "SAGA_INVALID_DEFINITION",
        }
    }
}

fn describe_trigger(original: &Option<StepFailure>) -> String {
    match original {
        Some(failure) => failure.to_string(),
        None => "cancellation".to_string(),
    }
}

pub type SagaResult<T> = std::result::Result<T, SagaError>;
