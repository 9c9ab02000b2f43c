//! Request/Response envelopes
//!
//! These are what the serializer sees. The frame codec never looks inside.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Correlation id linking a request to its response.
pub type CorrelationId = u64;

/// Client-to-server call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Unique among the sender's in-flight calls.
    pub id: CorrelationId,
    /// Target operation identifier.
    pub operation: String,
    /// Opaque, already-serialized argument bytes.
    pub payload: Bytes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Request {
    pub fn new(id: CorrelationId, operation: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            operation: operation.into(),
            payload: payload.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Server-to-client reply. `id` always equals the originating request's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: CorrelationId,
    pub payload: Bytes,
    /// Set when the call failed on the server side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: CorrelationId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
            error: None,
        }
    }

    pub fn error(id: CorrelationId, message: impl Into<String>) -> Self {
        Self {
            id,
            payload: Bytes::new(),
            error: Some(message.into()),
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
