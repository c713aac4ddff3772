//! Inbound client frames.
//!
//! A client sends UTF-8 JSON objects of the form `{"action": "...", "data": ...}`.
//! Anything else is malformed and gets dropped by the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A client frame that could not be decoded.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// The frame is not valid UTF-8.
    #[error("malformed payload: not valid UTF-8")]
    InvalidUtf8,
    /// The frame is not a JSON object with a string `action`.
    #[error("malformed payload: {0}")]
    InvalidJson(String),
}

/// A decoded client action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientPayload {
    /// Action name, becomes the last word of the publish routing key.
    pub action: String,
    /// Opaque action data, forwarded as the message body.
    #[serde(default)]
    pub data: Value,
}

impl ClientPayload {
    /// Decode a text frame.
    pub fn from_text(text: &str) -> Result<Self, PayloadError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;
        // serde would also accept `["move", {}]` for a struct
        if !value.is_object() {
            return Err(PayloadError::InvalidJson("expected a JSON object".into()));
        }
        serde_json::from_value(value).map_err(|e| PayloadError::InvalidJson(e.to_string()))
    }

    /// Decode a binary frame (must be UTF-8 JSON).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        let text = std::str::from_utf8(bytes).map_err(|_| PayloadError::InvalidUtf8)?;
        Self::from_text(text)
    }

    /// JSON encoding of `data`, the body published for this action.
    pub fn body(&self) -> Vec<u8> {
        // Serializing a `Value` cannot fail.
        serde_json::to_vec(&self.data).unwrap_or_default()
    }
}
