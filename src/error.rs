//! Error types for courier.
//!
//! Errors are split by blast radius: [`ProtocolViolation`] poisons a
//! connection, [`SerializationError`] affects exactly one message, and the
//! lifecycle variants never touch the wire at all.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Main error type for all courier operations.
#[derive(Debug, Error)]
pub enum Error {
    /// `startup()` called on an instance that already left `Uninitialized`.
    #[error("`{0}` already initialized")]
    DoubleInit(String),

    /// Configuration mutated after `startup()`.
    #[error("configuration of `{0}` is frozen after startup")]
    FrozenConfig(String),

    /// Operation requires a running instance.
    #[error("`{0}` is not running")]
    NotStarted(String),

    /// Connection-level framing failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    /// Encode/decode failure for a single message.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// No response correlated within the caller's deadline.
    #[error("no response for request {id} within {timeout:?}")]
    TimedOut { id: u64, timeout: Duration },

    /// The pending invocation was cancelled before a response arrived.
    #[error("invocation {0} was cancelled")]
    Cancelled(u64),

    /// Another call with the same correlation id is still in flight.
    #[error("request id {0} is already in flight")]
    DuplicateId(u64),

    /// The connection is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// I/O error during bind/connect/poll.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Framing errors. The connection that produced one must be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// Declared or actual payload length is above the configured maximum.
    #[error("frame of {len} bytes exceeds maximum frame size {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Serializer failure attributable to one request or response.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// Object could not be turned into bytes.
    #[error("{format} encode error: {message}")]
    Encode {
        format: &'static str,
        message: String,
    },

    /// Bytes could not be turned into the requested type.
    #[error("{format} decode error: {message}")]
    Decode {
        format: &'static str,
        message: String,
    },
}

impl SerializationError {
    pub fn encode(format: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Encode {
            format,
            message: err.to_string(),
        }
    }

    pub fn decode(format: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            format,
            message: err.to_string(),
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_too_large_message() {
        let err: Error = ProtocolViolation::FrameTooLarge {
            len: 65536,
            max: 65535,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "frame of 65536 bytes exceeds maximum frame size 65535"
        );
    }

    #[test]
    fn test_serialization_error_keeps_format() {
        let err = SerializationError::decode("json", "expected value at line 1");
        assert!(err.to_string().starts_with("json decode error"));
    }
}
