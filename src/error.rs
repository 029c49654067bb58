use crate::messaging::TransportError;
use thiserror::Error;

/// Pipeline error types
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Transport failure that is expected to clear on its own
    #[error("Transient transport error: {0}")]
    TransientTransport(#[source] TransportError),

    /// Transport failure that retrying will not fix
    #[error("Permanent transport error: {0}")]
    PermanentTransport(#[source] TransportError),

    /// The circuit breaker for the destination is open; no call was attempted
    #[error("Circuit breaker is open for '{0}'")]
    CircuitOpen(String),

    /// Admission denied by the backpressure controller
    #[error("Backpressure rejected: {0}")]
    BackpressureRejected(String),

    /// Message was quarantined and dead-lettered
    #[error("Message {message_id} quarantined after {attempts} failed attempts")]
    PoisonMessageQuarantined { message_id: String, attempts: u32 },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// The pipeline has been shut down
    #[error("Pipeline is shut down")]
    ShutDown,
}

impl PipelineError {
    /// Whether the failure is worth retrying locally
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientTransport(_))
    }

    /// Get error code string
    pub fn error_code(&self) -> &str {
        match self {
            PipelineError::TransientTransport(_) => "TRANSIENT_TRANSPORT_ERROR",
            PipelineError::PermanentTransport(_) => "PERMANENT_TRANSPORT_ERROR",
            PipelineError::CircuitOpen(_) => "CIRCUIT_OPEN",
            PipelineError::BackpressureRejected(_) => "BACKPRESSURE_REJECTED",
            PipelineError::PoisonMessageQuarantined { .. } => "POISON_MESSAGE_QUARANTINED",
            PipelineError::Serialization(_) => "SERIALIZATION_ERROR",
            PipelineError::Validation(_) => "VALIDATION_ERROR",
            PipelineError::Configuration(_) => "CONFIGURATION_ERROR",
            PipelineError::NotFound(_) => "NOT_FOUND",
            PipelineError::ShutDown => "SHUT_DOWN",
        }
    }
}

/// Conversion from serde_json::Error
impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

/// Conversion from config::ConfigError
impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::Configuration(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Alias used in the public pipeline API
pub type PipelineResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_transport_is_transient() {
        assert!(PipelineError::TransientTransport(TransportError::ConnectionFailed("reset".to_string())).is_transient());
        assert!(!PipelineError::PermanentTransport(TransportError::InvalidDestination("denied".to_string())).is_transient());
        assert!(!PipelineError::CircuitOpen("orders".to_string()).is_transient());
        assert!(!PipelineError::BackpressureRejected("full".to_string()).is_transient());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            PipelineError::CircuitOpen("orders".to_string()).error_code(),
            "CIRCUIT_OPEN"
        );
        assert_eq!(
            PipelineError::PoisonMessageQuarantined {
                message_id: "m-1".to_string(),
                attempts: 3
            }
            .error_code(),
            "POISON_MESSAGE_QUARANTINED"
        );
        assert_eq!(PipelineError::ShutDown.error_code(), "SHUT_DOWN");
    }

    #[test]
    fn test_serde_json_conversion() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        let pipeline_err: PipelineError = err.into();
        assert!(matches!(pipeline_err, PipelineError::Serialization(_)));
    }
}
