//! Protocol Layer: framing and envelopes
//!
//! Design principles:
//! - Frames are a 4-byte big-endian length plus payload, nothing else
//! - One shared, configurable size limit on encode and decode
//! - Payload encoding is pluggable and never seen by the codec

mod codec;
mod message;
mod serializer;

pub use codec::{Decoder, FrameCodec, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};
pub use message::{CorrelationId, Request, Response};
pub use serializer::{JsonSerializer, MsgPackSerializer, Serializer};
