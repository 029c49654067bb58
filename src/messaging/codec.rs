//! Payload serialization, compression and contract validation.

use crate::error::{PipelineError, Result};
use crate::messaging::config::CompressionConfig;
use crate::messaging::envelope::{headers, Headers};
use serde_json::Value;

/// Value of the `content-encoding` header on lz4-compressed payloads
pub const LZ4_ENCODING: &str = "lz4";

/// Turns message values into bytes and back
pub trait Codec: Send + Sync {
    /// Written to the `content-type` header
    fn content_type(&self) -> &str;

    fn serialize(&self, value: &Value) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8], message_type: &str) -> Result<Value>;
}

/// Default codec backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8], message_type: &str) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| {
            PipelineError::Serialization(format!("failed to decode {}: {}", message_type, e))
        })
    }
}

/// Optional contract check run before a message is serialized
pub trait MessageValidator: Send + Sync {
    fn validate(&self, message_type: &str, value: &Value) -> std::result::Result<(), String>;
}

impl<F> MessageValidator for F
where
    F: Fn(&str, &Value) -> std::result::Result<(), String> + Send + Sync,
{
    fn validate(&self, message_type: &str, value: &Value) -> std::result::Result<(), String> {
        self(message_type, value)
    }
}

/// Compress with lz4, length-prefixed
pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Decompress a length-prefixed lz4 payload. The prefix is checked against
/// `max_size` before anything is allocated.
pub fn decompress(data: &[u8], max_size: usize) -> Result<Vec<u8>> {
    let lz4_error = |e: lz4_flex::block::DecompressError| {
        PipelineError::Serialization(format!("lz4 decompression failed: {}", e))
    };

    let (size, block) = lz4_flex::block::uncompressed_size(data).map_err(lz4_error)?;
    if size > max_size {
        return Err(PipelineError::Serialization(format!(
            "lz4 payload declares {} bytes, limit is {}",
            size, max_size
        )));
    }

    let mut decompressed = vec![0u8; size];
    let written = lz4_flex::block::decompress_into(block, &mut decompressed).map_err(lz4_error)?;
    if written != size {
        return Err(PipelineError::Serialization(format!(
            "lz4 payload declares {} bytes but holds {}",
            size, written
        )));
    }
    Ok(decompressed)
}

/// Encoded payload ready to be put into an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub compressed: bool,
    /// Serialized size before compression
    pub decoded_len: usize,
}

impl EncodedPayload {
    /// Larger of the wire size and the decompressed size
    pub fn max_len(&self) -> usize {
        self.bytes.len().max(self.decoded_len)
    }
}

/// Serialize a value and compress it when the config says so
pub fn encode(
    codec: &dyn Codec,
    compression: &CompressionConfig,
    value: &Value,
) -> Result<EncodedPayload> {
    let bytes = codec.serialize(value)?;
    let content_type = codec.content_type().to_string();
    let decoded_len = bytes.len();

    if compression.should_compress(bytes.len(), &content_type) {
        Ok(EncodedPayload {
            bytes: compress(&bytes),
            content_type,
            compressed: true,
            decoded_len,
        })
    } else {
        Ok(EncodedPayload {
            bytes,
            content_type,
            compressed: false,
            decoded_len,
        })
    }
}

/// Decompress if the headers carry the marker, then deserialize. A
/// compressed payload may expand to at most `max_size` bytes.
pub fn decode(codec: &dyn Codec, payload: &[u8], headers: &Headers, max_size: usize) -> Result<Value> {
    let message_type = headers
        .get(headers::MESSAGE_TYPE)
        .map(String::as_str)
        .unwrap_or("unknown");

    match headers.get(headers::CONTENT_ENCODING).map(String::as_str) {
        None => codec.deserialize(payload, message_type),
        Some(LZ4_ENCODING) => codec.deserialize(&decompress(payload, max_size)?, message_type),
        Some(other) => Err(PipelineError::Serialization(format!(
            "unsupported content encoding '{}'",
            other
        ))),
    }
}
