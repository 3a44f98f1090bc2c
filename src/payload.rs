//! Payload decoding for received MQTT messages
//!
//! Pure functions mapping a raw payload plus the configured format to a
//! structured value. Decoding never touches shared state, so callers run it
//! after a message has left the buffer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Declared format of message payloads on the subscribed topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Bytes are passed through untouched
    #[default]
    Raw,
    /// Payload is parsed as a JSON document
    Json,
    /// Payload is reinterpreted as text
    String,
}

impl PayloadFormat {
    /// Parse the `msg_type` attribute. The empty string and "raw" both select
    /// the raw format; anything else outside the closed set is rejected.
    pub fn parse(msg_type: &str) -> Option<Self> {
        match msg_type {
            "" | "raw" => Some(PayloadFormat::Raw),
            "json" => Some(PayloadFormat::Json),
            "string" => Some(PayloadFormat::String),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadFormat::Raw => "raw",
            PayloadFormat::Json => "json",
            PayloadFormat::String => "string",
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded payload value
///
/// Serializes untagged so a reading's `payload` field carries the value
/// itself: a JSON document, a string, or an array of byte values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Json(Value),
    Text(String),
    Raw(Bytes),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("error parsing JSON message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode `raw` according to `format`.
///
/// Only the JSON format can fail; text decoding is lossy (invalid UTF-8
/// sequences become U+FFFD) and raw decoding returns the same bytes.
pub fn decode(format: PayloadFormat, raw: &Bytes) -> Result<Payload, DecodeError> {
    match format {
        PayloadFormat::Json => Ok(Payload::Json(serde_json::from_slice(raw)?)),
        PayloadFormat::String => Ok(Payload::Text(String::from_utf8_lossy(raw).into_owned())),
        PayloadFormat::Raw => Ok(Payload::Raw(raw.clone())),
    }
}
