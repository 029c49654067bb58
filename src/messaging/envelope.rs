//! Envelope wrapping every payload that crosses a transport.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;

/// Header map carried with every envelope
pub type Headers = BTreeMap<String, String>;

/// Well-known header keys
pub mod headers {
    pub const MESSAGE_ID: &str = "message-id";
    pub const MESSAGE_TYPE: &str = "message-type";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const ROUTING_KEY: &str = "routing-key";
    /// RFC 3339
    pub const TIMESTAMP: &str = "timestamp";
    pub const CONTENT_TYPE: &str = "content-type";
    /// Compression marker
    pub const CONTENT_ENCODING: &str = "content-encoding";
    pub const SOURCE: &str = "source";

    pub const DEAD_LETTER_REASON: &str = "x-dead-letter-reason";
    pub const DEAD_LETTER_ATTEMPTS: &str = "x-dead-letter-attempts";
    pub const ORIGINAL_DESTINATION: &str = "x-original-destination";
}

/// A typed message that can travel through the pipeline
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type tag written to the `message-type` header
    const MESSAGE_TYPE: &'static str;
}

/// Payload plus headers. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    payload: Vec<u8>,
    headers: Headers,
}

impl Envelope {
    /// Start building an envelope for a message type
    pub fn builder(message_type: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder {
            message_type: message_type.into(),
            message_id: None,
            correlation_id: None,
            routing_key: None,
            source: None,
            content_type: None,
            content_encoding: None,
            extra: Headers::new(),
        }
    }

    /// Rebuild an envelope from what a transport delivered
    pub fn from_parts(payload: Vec<u8>, headers: Headers) -> Self {
        Self { payload, headers }
    }

    pub fn into_parts(self) -> (Vec<u8>, Headers) {
        (self.payload, self.headers)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header(headers::MESSAGE_ID)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header(headers::MESSAGE_TYPE)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(headers::CORRELATION_ID)
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.header(headers::ROUTING_KEY)
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.header(headers::CONTENT_ENCODING)
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.header(headers::TIMESTAMP)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }
}

/// Builder filling in generated metadata
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    message_type: String,
    message_id: Option<String>,
    correlation_id: Option<String>,
    routing_key: Option<String>,
    source: Option<String>,
    content_type: Option<String>,
    content_encoding: Option<String>,
    extra: Headers,
}

impl EnvelopeBuilder {
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    /// Add an application header. Well-known keys set by the builder win.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Finish the envelope; message id and correlation id are generated if absent
    pub fn build(self, payload: Vec<u8>) -> Envelope {
        let mut map = self.extra;
        let message_id = self
            .message_id
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let correlation_id = self.correlation_id.unwrap_or_else(|| message_id.clone());

        map.insert(headers::MESSAGE_ID.to_string(), message_id);
        map.insert(headers::MESSAGE_TYPE.to_string(), self.message_type);
        map.insert(headers::CORRELATION_ID.to_string(), correlation_id);
        map.insert(headers::TIMESTAMP.to_string(), Utc::now().to_rfc3339());
        if let Some(routing_key) = self.routing_key {
            map.insert(headers::ROUTING_KEY.to_string(), routing_key);
        }
        if let Some(source) = self.source {
            map.insert(headers::SOURCE.to_string(), source);
        }
        if let Some(content_type) = self.content_type {
            map.insert(headers::CONTENT_TYPE.to_string(), content_type);
        }
        if let Some(encoding) = self.content_encoding {
            map.insert(headers::CONTENT_ENCODING.to_string(), encoding);
        }

        Envelope {
            payload,
            headers: map,
        }
    }
}
