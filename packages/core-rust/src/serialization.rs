//! Content-type keyed payload serializers.
//!
//! [`SerializerProvider`] holds an ordered list of [`Serializer`]s and picks
//! the first one that claims a content type. The default provider ships JSON
//! (first, so it wins for `+json` media types), `MsgPack` and plain text.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::types::Value;

/// Content type used when neither the message nor the document declares one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Errors raised while encoding or decoding a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SerializationError {
    #[error("no serializer registered for content type `{content_type}`")]
    Unsupported { content_type: String },
    #[error("failed to encode `{content_type}` value: {reason}")]
    Encode { content_type: String, reason: String },
    #[error("failed to decode `{content_type}` bytes: {reason}")]
    Decode { content_type: String, reason: String },
}

/// Returns the media-type essence: lowercase, parameters stripped.
///
/// `Application/JSON; charset=utf-8` becomes `application/json`.
#[must_use]
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// A payload codec for one family of content types.
pub trait Serializer: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this serializer handles `essence` (already normalized).
    fn supports(&self, essence: &str) -> bool;

    /// Encodes a value.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::Encode`] when the value cannot be encoded.
    fn serialize(&self, value: &Value) -> Result<Bytes, SerializationError>;

    /// Decodes raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::Decode`] when the bytes are malformed.
    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializationError>;
}

// ---------------------------------------------------------------------------
// Built-in serializers
// ---------------------------------------------------------------------------

/// `application/json`, `text/json` and any `+json` structured suffix.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn supports(&self, essence: &str) -> bool {
        essence == "application/json" || essence == "text/json" || essence.ends_with("+json")
    }

    fn serialize(&self, value: &Value) -> Result<Bytes, SerializationError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| SerializationError::Encode {
                content_type: "application/json".to_string(),
                reason: e.to_string(),
            })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode {
            content_type: "application/json".to_string(),
            reason: e.to_string(),
        })
    }
}

/// `MsgPack` via `rmp-serde`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn supports(&self, essence: &str) -> bool {
        matches!(
            essence,
            "application/msgpack" | "application/x-msgpack" | "application/vnd.msgpack"
        )
    }

    fn serialize(&self, value: &Value) -> Result<Bytes, SerializationError> {
        rmp_serde::to_vec_named(value)
            .map(Bytes::from)
            .map_err(|e| SerializationError::Encode {
                content_type: "application/msgpack".to_string(),
                reason: e.to_string(),
            })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        rmp_serde::from_slice(bytes).map_err(|e| SerializationError::Decode {
            content_type: "application/msgpack".to_string(),
            reason: e.to_string(),
        })
    }
}

/// `text/*`. Strings travel as their UTF-8 bytes; other values as JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextSerializer;

impl Serializer for TextSerializer {
    fn name(&self) -> &'static str {
        "text"
    }

    fn supports(&self, essence: &str) -> bool {
        essence.starts_with("text/")
    }

    fn serialize(&self, value: &Value) -> Result<Bytes, SerializationError> {
        Ok(match value {
            Value::String(s) => Bytes::copy_from_slice(s.as_bytes()),
            other => Bytes::from(other.to_string()),
        })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        std::str::from_utf8(bytes)
            .map(|s| Value::String(s.to_string()))
            .map_err(|e| SerializationError::Decode {
                content_type: "text/plain".to_string(),
                reason: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// SerializerProvider
// ---------------------------------------------------------------------------

/// Ordered set of serializers, selected by content type.
#[derive(Debug, Clone, Default)]
pub struct SerializerProvider {
    serializers: Vec<Arc<dyn Serializer>>,
}

impl SerializerProvider {
    /// Creates a provider with no serializers.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a provider with JSON, `MsgPack`, and text serializers.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut provider = Self::empty();
        provider.register(Arc::new(JsonSerializer));
        provider.register(Arc::new(MsgPackSerializer));
        provider.register(Arc::new(TextSerializer));
        provider
    }

    /// Appends a serializer. Earlier registrations take precedence.
    pub fn register(&mut self, serializer: Arc<dyn Serializer>) {
        self.serializers.push(serializer);
    }

    /// Returns the serializer for `content_type`, if any.
    #[must_use]
    pub fn get(&self, content_type: &str) -> Option<Arc<dyn Serializer>> {
        let essence = essence(content_type);
        self.serializers
            .iter()
            .find(|s| s.supports(&essence))
            .cloned()
    }

    #[must_use]
    pub fn supports(&self, content_type: &str) -> bool {
        self.get(content_type).is_some()
    }

    /// Encodes `value` with the serializer registered for `content_type`.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::Unsupported`] when no serializer claims
    /// the content type, or the serializer's encode error.
    pub fn serialize_for(&self, content_type: &str, value: &Value) -> Result<Bytes, SerializationError> {
        self.lookup(content_type)?.serialize(value)
    }

    /// Decodes `bytes` with the serializer registered for `content_type`.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::Unsupported`] when no serializer claims
    /// the content type, or the serializer's decode error.
    pub fn deserialize_for(&self, content_type: &str, bytes: &[u8]) -> Result<Value, SerializationError> {
        self.lookup(content_type)?.deserialize(bytes)
    }

    fn lookup(&self, content_type: &str) -> Result<Arc<dyn Serializer>, SerializationError> {
        self.get(content_type)
            .ok_or_else(|| SerializationError::Unsupported {
                content_type: content_type.to_string(),
            })
    }
}
