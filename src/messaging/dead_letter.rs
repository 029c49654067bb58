//! Dead-letter routing for messages that can never be processed.

use crate::error::Result;
use crate::messaging::envelope::{headers, Headers};
use crate::messaging::transport::BrokerTransport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::error;

/// Why a message was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeadLetterReason {
    /// Handler failed `poison.threshold` times
    PoisonThreshold,
    /// Payload could not be decoded
    DecodeFailure,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::PoisonThreshold => write!(f, "poison-threshold"),
            DeadLetterReason::DecodeFailure => write!(f, "decode-failure"),
        }
    }
}

/// A message removed from the live stream
#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    pub original_destination: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub reason: DeadLetterReason,
    pub attempts: u32,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_ID).map(String::as_str)
    }

    /// Original headers plus the dead-letter annotations
    pub fn annotated_headers(&self) -> Headers {
        let mut annotated = self.headers.clone();
        annotated.insert(
            headers::DEAD_LETTER_REASON.to_string(),
            self.reason.to_string(),
        );
        annotated.insert(
            headers::DEAD_LETTER_ATTEMPTS.to_string(),
            self.attempts.to_string(),
        );
        annotated.insert(
            headers::ORIGINAL_DESTINATION.to_string(),
            self.original_destination.clone(),
        );
        annotated
    }
}

/// Destination for dead-lettered messages
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, record: DeadLetterRecord) -> Result<()>;
}

/// Publishes dead letters to a destination on a transport
pub struct TransportDeadLetterSink {
    transport: Arc<dyn BrokerTransport>,
    destination: String,
}

impl TransportDeadLetterSink {
    pub fn new(transport: Arc<dyn BrokerTransport>, destination: impl Into<String>) -> Self {
        Self {
            transport,
            destination: destination.into(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for TransportDeadLetterSink {
    async fn send(&self, record: DeadLetterRecord) -> Result<()> {
        self.transport
            .publish_raw(&self.destination, &record.payload, &record.annotated_headers())
            .await
            .map_err(|e| {
                error!(
                    destination = %self.destination,
                    message_id = ?record.message_id(),
                    error = %e,
                    "Failed to publish dead letter"
                );
                e.into()
            })
    }
}

/// Keeps dead letters in memory
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    records: Arc<Mutex<Vec<DeadLetterRecord>>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn send(&self, record: DeadLetterRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}
