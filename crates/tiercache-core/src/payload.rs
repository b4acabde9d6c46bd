//! Byte boundary between typed values and Tier-2 payloads.
//!
//! ## Wire Format
//!
//! ```text
//! +-------+---------+--------+---------+-----------+--------------+
//! | "TC"  | version | format | tag len | type tag  | body         |
//! | 2 B   | 1 B     | 1 B    | u16 BE  | tag len B | rest         |
//! +-------+---------+--------+---------+-----------+--------------+
//! ```
//!
//! The body is MessagePack (default) or JSON. The type tag is checked before the
//! body is touched, so a payload written for another type is a typed failure
//! rather than a lucky partial decode.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const MAGIC: [u8; 2] = *b"TC";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 6;

/// Values that can travel through both tiers.
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Body encoding used inside a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// MessagePack via `rmp-serde` (compact, default).
    #[default]
    MsgPack,
    /// JSON via `serde_json` (readable with `redis-cli`).
    Json,
}

impl PayloadFormat {
    fn to_byte(self) -> u8 {
        match self {
            Self::MsgPack => 0,
            Self::Json => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::MsgPack),
            1 => Some(Self::Json),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MsgPack => write!(f, "msgpack"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Failure to turn a value into a payload. Surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    #[error("Cannot encode {type_tag} as {format}: {message}")]
    Body {
        type_tag: String,
        format: PayloadFormat,
        message: String,
    },

    #[error("Type tag {type_tag} is longer than {max} bytes")]
    TagTooLong { type_tag: String, max: usize },
}

/// Failure to turn stored bytes back into a value. Treated as a miss.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodingError {
    #[error("Malformed payload: {reason}")]
    Malformed { reason: String },

    #[error("Unsupported payload version {0}")]
    UnsupportedVersion(u8),

    #[error("Payload holds {found}, expected {expected}")]
    TypeMismatch { expected: String, found: String },

    #[error("Cannot decode {type_tag} from {format}: {message}")]
    Body {
        type_tag: String,
        format: PayloadFormat,
        message: String,
    },
}

impl DecodingError {
    /// Whether the bytes themselves are unusable. A payload holding a valid
    /// value of another type is not corrupt.
    pub fn is_corrupt(&self) -> bool {
        !matches!(self, Self::TypeMismatch { .. })
    }

    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Encoded bytes plus the type tag they were produced for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedPayload {
    type_tag: Arc<str>,
    bytes: Arc<[u8]>,
}

impl SerializedPayload {
    /// Logical type the payload decodes to.
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// Complete wire bytes (header and body).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Converts typed values to Tier-2 payloads and back.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerializationGate {
    format: PayloadFormat,
}

impl SerializationGate {
    pub fn new(format: PayloadFormat) -> Self {
        Self { format }
    }

    /// Format used for new payloads. Decoding accepts either format.
    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    /// The type tag written for `T`.
    pub fn type_tag<T: ?Sized>() -> &'static str {
        type_name::<T>()
    }

    /// Encode a value into a payload.
    ///
    /// # Errors
    ///
    /// Returns `EncodingError` if the value cannot be represented in the
    /// configured format.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<SerializedPayload, EncodingError> {
        let type_tag = Self::type_tag::<T>();
        let tag_len = u16::try_from(type_tag.len()).map_err(|_| EncodingError::TagTooLong {
            type_tag: type_tag.to_string(),
            max: u16::MAX as usize,
        })?;

        let body = match self.format {
            PayloadFormat::MsgPack => rmp_serde::to_vec_named(value).map_err(|e| e.to_string()),
            PayloadFormat::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
        }
        .map_err(|message| EncodingError::Body {
            type_tag: type_tag.to_string(),
            format: self.format,
            message,
        })?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + type_tag.len() + body.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION);
        bytes.push(self.format.to_byte());
        bytes.extend_from_slice(&tag_len.to_be_bytes());
        bytes.extend_from_slice(type_tag.as_bytes());
        bytes.extend_from_slice(&body);

        Ok(SerializedPayload {
            type_tag: Arc::from(type_tag),
            bytes: Arc::from(bytes),
        })
    }

    /// Decode stored bytes as a `T`.
    ///
    /// Empty input means "no value" and yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns `DecodingError` if the header is damaged, the payload was written
    /// for another type, or the body does not parse.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<Option<T>, DecodingError> {
        if bytes.is_empty() {
            return Ok(None);
        }
        if bytes.len() < HEADER_LEN {
            return Err(DecodingError::malformed(format!(
                "{} bytes is shorter than the header",
                bytes.len()
            )));
        }
        if bytes[..2] != MAGIC {
            return Err(DecodingError::malformed("bad magic"));
        }
        if bytes[2] != VERSION {
            return Err(DecodingError::UnsupportedVersion(bytes[2]));
        }
        let format = PayloadFormat::from_byte(bytes[3])
            .ok_or_else(|| DecodingError::malformed(format!("unknown format {}", bytes[3])))?;

        let tag_len = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
        let tag_end = HEADER_LEN + tag_len;
        let tag_bytes = bytes
            .get(HEADER_LEN..tag_end)
            .ok_or_else(|| DecodingError::malformed("truncated type tag"))?;
        let found = std::str::from_utf8(tag_bytes)
            .map_err(|_| DecodingError::malformed("type tag is not UTF-8"))?;

        let expected = Self::type_tag::<T>();
        if found != expected {
            return Err(DecodingError::TypeMismatch {
                expected: expected.to_string(),
                found: found.to_string(),
            });
        }

        let body = &bytes[tag_end..];
        let value = match format {
            PayloadFormat::MsgPack => rmp_serde::from_slice(body).map_err(|e| e.to_string()),
            PayloadFormat::Json => serde_json::from_slice(body).map_err(|e| e.to_string()),
        }
        .map_err(|message| DecodingError::Body {
            type_tag: expected.to_string(),
            format,
            message,
        })?;

        Ok(Some(value))
    }
}
