//! Error types for transport operations

use crate::error::PipelineError;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors raised by a [`BrokerTransport`](crate::messaging::BrokerTransport)
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection failed or was lost
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Publish failed
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Subscribe failed
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Receiving a delivery failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Ack or reject failed
    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Payload exceeds what the broker accepts
    #[error("Message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// Destination does not exist or is not allowed
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Transport has been closed
    #[error("Transport is closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed(_)
                | TransportError::PublishFailed(_)
                | TransportError::ReceiveFailed(_)
                | TransportError::AckFailed(_)
                | TransportError::Timeout(_)
        )
    }
}

impl From<TransportError> for PipelineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => PipelineError::ShutDown,
            err if err.is_transient() => PipelineError::TransientTransport(err),
            err => PipelineError::PermanentTransport(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Timeout("publish".into()).is_transient());
        assert!(TransportError::ConnectionFailed("reset".into()).is_transient());
        assert!(!TransportError::InvalidDestination("x".into()).is_transient());
        assert!(!TransportError::MessageTooLarge { size: 2, limit: 1 }.is_transient());
    }

    #[test]
    fn test_conversion_into_pipeline_error() {
        let err: PipelineError = TransportError::PublishFailed("nack".into()).into();
        assert!(matches!(err, PipelineError::TransientTransport(_)));

        let err: PipelineError = TransportError::InvalidDestination("x".into()).into();
        assert!(matches!(err, PipelineError::PermanentTransport(_)));

        let err: PipelineError = TransportError::Closed.into();
        assert!(matches!(err, PipelineError::ShutDown));
    }

    #[test]
    fn test_conversion_keeps_transport_error() {
        use std::error::Error;

        let err: PipelineError = TransportError::Timeout("publish".into()).into();
        assert!(matches!(
            &err,
            PipelineError::TransientTransport(TransportError::Timeout(msg)) if msg == "publish"
        ));

        let source = err.source().expect("transport error as source");
        assert!(matches!(
            source.downcast_ref::<TransportError>(),
            Some(TransportError::Timeout(_))
        ));

        let err: PipelineError = TransportError::MessageTooLarge { size: 2, limit: 1 }.into();
        assert!(matches!(
            err,
            PipelineError::PermanentTransport(TransportError::MessageTooLarge { size: 2, limit: 1 })
        ));
    }
}
