//! Pluggable serializers
//!
//! A serializer turns envelopes into frame payloads and back. It is a
//! capability, not a hierarchy: anything implementing [`Serializer`] can be
//! handed to the client or server.
//!
//! - [`MsgPackSerializer`] - MessagePack via `rmp-serde`, named fields
//! - [`JsonSerializer`] - JSON via `serde_json`

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SerializationError;

/// Encode/decode capability used by the pipeline's serializer stage.
///
/// Failures are scoped to the one value being processed.
pub trait Serializer: Send + Sync + 'static {
    /// Short format name for logs and errors.
    fn name(&self) -> &'static str;

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError>;
}

/// MessagePack with field names kept, so payloads stay readable from other
/// languages' msgpack tooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    #[inline]
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        rmp_serde::to_vec_named(value).map_err(|e| SerializationError::encode(self.name(), e))
    }

    #[inline]
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        rmp_serde::from_slice(bytes).map_err(|e| SerializationError::decode(self.name(), e))
    }
}

/// JSON text. Byte payloads become arrays of numbers; prefer msgpack when
/// payload size matters.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(value).map_err(|e| SerializationError::encode(self.name(), e))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::decode(self.name(), e))
    }
}
