//! Messaging configuration

use crate::config::duration_ms;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// NATS configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URLs
    pub servers: Vec<String>,

    /// Connection name
    pub connection_name: String,

    /// Maximum reconnect attempts
    pub max_reconnects: Option<usize>,

    /// Ping interval
    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,

    /// Request timeout
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            connection_name: "resilient-messaging".to_string(),
            max_reconnects: Some(10),
            ping_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Payload compression settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,

    /// Payloads at least this large are compressed
    pub threshold_bytes: usize,

    /// Content types that are never compressed (already compact)
    pub excluded_content_types: Vec<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 4096,
            excluded_content_types: vec![
                "application/gzip".to_string(),
                "application/zip".to_string(),
                "image/jpeg".to_string(),
                "image/png".to_string(),
            ],
        }
    }
}

impl CompressionConfig {
    /// Whether a payload of this size and content type should be compressed
    pub fn should_compress(&self, size: usize, content_type: &str) -> bool {
        self.enabled
            && size >= self.threshold_bytes
            && !self
                .excluded_content_types
                .iter()
                .any(|excluded| excluded.eq_ignore_ascii_case(content_type))
    }
}

/// Main messaging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Prefix used when a publish does not name a destination
    pub destination_prefix: String,

    /// Value of the `source` header on published envelopes
    pub source: String,

    /// Where quarantined and undecodable messages go
    pub dead_letter_destination: String,

    /// Maximum encoded payload size in bytes
    pub max_message_size: usize,

    pub compression: CompressionConfig,

    pub nats: NatsConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            destination_prefix: "messages".to_string(),
            source: "resilient-messaging".to_string(),
            dead_letter_destination: "dead-letter".to_string(),
            max_message_size: 1_048_576, // 1MB
            compression: CompressionConfig::default(),
            nats: NatsConfig::default(),
        }
    }
}

impl MessagingConfig {
    /// Default destination for a message type
    pub fn destination_for(&self, message_type: &str) -> String {
        format!("{}.{}", self.destination_prefix, message_type)
    }

    pub fn validate(&self) -> Result<()> {
        if self.destination_prefix.is_empty() {
            return Err(PipelineError::Configuration(
                "messaging.destination_prefix must not be empty".to_string(),
            ));
        }
        if self.dead_letter_destination.is_empty() {
            return Err(PipelineError::Configuration(
                "messaging.dead_letter_destination must not be empty".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(PipelineError::Configuration(
                "messaging.max_message_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
