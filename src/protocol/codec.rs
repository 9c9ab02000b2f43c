//! Length-prefixed frame codec
//!
//! Wire layout:
//! ┌──────────────────────────┬──────────────────────────┐
//! │ length (u32, big-endian) │ payload (length bytes)   │
//! └──────────────────────────┴──────────────────────────┘
//!
//! No other header. The codec owns the maximum frame size and both
//! directions enforce the same limit.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolViolation;

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum payload size per frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 65535;

/// Initial decode buffer capacity.
const INITIAL_BUFFER_CAPACITY: usize = 64 * 1024;

/// Stateless frame encoder and decoder factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Limit is capped at `u32::MAX`, the largest length the prefix can carry.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(u32::MAX as usize),
        }
    }

    #[inline(always)]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    #[inline(always)]
    fn check(&self, len: usize) -> Result<(), ProtocolViolation> {
        if len > self.max_frame_size {
            return Err(ProtocolViolation::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Encode one payload into a new frame.
    ///
    /// Fails before allocating anything if the payload is over the limit.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, ProtocolViolation> {
        self.check(payload.len())?;
        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        self.encode_into(payload, &mut frame)?;
        Ok(frame.freeze())
    }

    /// Append one frame to `dst`. `dst` is untouched on error.
    pub fn encode_into(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolViolation> {
        self.check(payload.len())?;
        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);
        Ok(())
    }

    /// Fresh per-connection decoder sharing this codec's limit.
    pub fn decoder(&self) -> Decoder {
        Decoder::new(self.max_frame_size)
    }
}

/// Parse state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Need 4 prefix bytes.
    Header,
    /// Prefix consumed, need this many payload bytes.
    Payload(usize),
    /// A protocol violation was seen; the stream cannot be resynchronized.
    Failed(ProtocolViolation),
}

/// Streaming frame decoder. One per connection.
#[derive(Debug)]
pub struct Decoder {
    buffer: BytesMut,
    state: DecodeState,
    max_frame_size: usize,
}

impl Decoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(
                INITIAL_BUFFER_CAPACITY.min(max_frame_size.saturating_add(LENGTH_PREFIX_SIZE)),
            ),
            state: DecodeState::Header,
            max_frame_size,
        }
    }

    /// Append raw bytes read from the socket.
    #[inline]
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pull the next complete frame, if any.
    ///
    /// Returns `Ok(None)` while more bytes are needed. After an error every
    /// later call returns the same error.
    pub fn decode(&mut self) -> Result<Option<Bytes>, ProtocolViolation> {
        loop {
            match self.state {
                DecodeState::Failed(violation) => return Err(violation),
                DecodeState::Header => {
                    if self.buffer.len() < LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }
                    let len = self.buffer.get_u32() as usize;
                    if len > self.max_frame_size {
                        self.state = DecodeState::Failed(ProtocolViolation::FrameTooLarge {
                            len,
                            max: self.max_frame_size,
                        });
                        continue;
                    }
                    self.buffer.reserve(len);
                    self.state = DecodeState::Payload(len);
                }
                DecodeState::Payload(len) => {
                    if self.buffer.len() < len {
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(len).freeze();
                    self.state = DecodeState::Header;
                    return Ok(Some(payload));
                }
            }
        }
    }

    /// Append `data` and drain every complete frame.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, ProtocolViolation> {
        self.extend(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.decode()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes buffered but not yet emitted as a frame.
    #[inline(always)]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
