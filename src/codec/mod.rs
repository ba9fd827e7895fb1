//! Binary frame codecs and protocol message types.
//!
//! - [`quantized`]: `i16 / 32767` float vectors
//! - [`face`]: deflate-compressed, schema-encoded facial animation batches
//! - [`wire`]: typed inbound/outbound protocol messages
//!
//! Decoding is pure and never blocks. Failures come back as [`CodecError`] so a
//! single bad frame can be dropped without disturbing the transport read loop.

pub mod face;
pub mod quantized;
pub mod wire;

use thiserror::Error;

/// Errors raised while decoding a frame or protocol message.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum CodecError {
    #[error("Payload truncated: expected at least {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("Decompression failed: {details}")]
    Decompress { details: String },

    #[error("Decompressed payload exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Schema decode failed: {details}")]
    Schema { details: String },

    #[error("Field '{field}' has {found} entries, expected {expected}")]
    FieldMismatch { field: &'static str, expected: usize, found: usize },

    #[error("Frame index overflows starting at {start}")]
    FrameOverflow { start: u32 },

    #[error("Unknown event '{event}'")]
    UnknownEvent { event: String },

    #[error("Malformed '{event}' message: {details}")]
    Message { event: String, details: String },

    #[error("Event '{event}' expects a {expected} payload")]
    UnexpectedPayload { event: String, expected: &'static str },
}

impl CodecError {
    /// Helper constructor for malformed JSON messages.
    pub fn message(event: impl Into<String>, details: impl std::fmt::Display) -> Self {
        CodecError::Message { event: event.into(), details: details.to_string() }
    }
}
