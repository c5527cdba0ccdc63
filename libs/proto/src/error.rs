//! Error types for the node model and message codec.

use thiserror::Error;

/// Errors produced while validating, converting, or framing messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// A required field is missing or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A field holds a value that is not allowed.
    #[error("invalid value for {field}: {detail}")]
    InvalidField { field: String, detail: String },

    /// The structured or textual representation could not be decoded.
    #[error("malformed node config: {0}")]
    MalformedConfig(String),

    /// A framed message could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A message exceeded the maximum frame size.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        ProtoError::Serialization(err.to_string())
    }
}
