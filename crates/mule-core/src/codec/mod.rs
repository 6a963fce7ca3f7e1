//! Payload serialization.
//!
//! Task arguments and results cross the queue as opaque, self-describing
//! envelopes: a codec tag, a format version, and a base64 body. The core
//! never inspects the decoded contents; only workers do. Base64 keeps
//! arbitrary bytes safe across the JSON columns they are stored in.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Codec tag for JSON-encoded bodies.
pub const CODEC_JSON: &str = "json";

/// Codec tag for raw, uninterpreted byte bodies.
pub const CODEC_RAW: &str = "raw";

/// Current envelope format version.
pub const PAYLOAD_VERSION: u32 = 1;

/// Errors from encoding or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The value cannot be represented by the codec (e.g. a map with
    /// non-string keys under the JSON codec).
    #[error("unsupported payload type: {0}")]
    UnsupportedType(String),

    /// The envelope names a codec this build does not understand.
    #[error("unsupported codec: {0:?}")]
    UnsupportedCodec(String),

    /// The envelope's format version is not one this build can read.
    #[error("payload version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// The body does not decode (bad base64 or malformed contents).
    #[error("corrupt payload: {0}")]
    Corrupt(String),
}

/// A self-describing serialized payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub codec: String,
    pub version: u32,
    /// Base64-encoded body bytes.
    pub body: String,
}

impl Payload {
    /// Encode a serde value under the JSON codec.
    pub fn encode_json<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| CodecError::UnsupportedType(e.to_string()))?;
        Ok(Self {
            codec: CODEC_JSON.to_owned(),
            version: PAYLOAD_VERSION,
            body: BASE64.encode(bytes),
        })
    }

    /// Wrap raw bytes without interpretation.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            codec: CODEC_RAW.to_owned(),
            version: PAYLOAD_VERSION,
            body: BASE64.encode(bytes),
        }
    }

    /// An empty payload (JSON `null`).
    pub fn empty() -> Self {
        Self::encode_json(&serde_json::Value::Null)
            .unwrap_or_else(|_| unreachable!("null always encodes"))
    }

    /// Decode the body under the JSON codec into a typed value.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        self.check_tags(CODEC_JSON)?;
        let bytes = self.body_bytes()?;
        serde_json::from_slice(&bytes).map_err(|e| CodecError::Corrupt(e.to_string()))
    }

    /// Decode the raw body bytes.
    pub fn decode_bytes(&self) -> Result<Vec<u8>, CodecError> {
        self.check_tags(CODEC_RAW)?;
        self.body_bytes()
    }

    /// Serialize the envelope itself to a JSON value for storage.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "codec": self.codec,
            "version": self.version,
            "body": self.body,
        })
    }

    /// Parse an envelope back out of its stored JSON value.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, CodecError> {
        serde_json::from_value(value.clone()).map_err(|e| CodecError::Corrupt(e.to_string()))
    }

    fn check_tags(&self, expected_codec: &str) -> Result<(), CodecError> {
        if self.version != PAYLOAD_VERSION {
            return Err(CodecError::VersionMismatch {
                expected: PAYLOAD_VERSION,
                found: self.version,
            });
        }
        if self.codec != expected_codec {
            return Err(CodecError::UnsupportedCodec(self.codec.clone()));
        }
        Ok(())
    }

    fn body_bytes(&self) -> Result<Vec<u8>, CodecError> {
        BASE64
            .decode(&self.body)
            .map_err(|e| CodecError::Corrupt(format!("invalid base64 body: {e}")))
    }
}
