//! Connection state owned by an I/O thread
//!
//! One socket, its frame decoder and its pending-write buffer. Only the
//! owning I/O thread touches this; other threads go through `Channel`.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use super::channel::Channel;
use super::pipeline::Pipeline;
use crate::error::ProtocolViolation;
use crate::protocol::Decoder;

/// Size of the per-thread read scratch buffer.
pub(crate) const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Initial write buffer capacity.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Why a connection is being torn down.
#[derive(Debug)]
pub(crate) enum CloseReason {
    /// Peer sent EOF.
    PeerClosed,
    /// Peer stopped reading and the write backlog passed its limit.
    WriteOverflow { pending: usize, limit: usize },
    /// Owning I/O thread is shutting down.
    Shutdown,
    /// Socket error.
    Io(io::Error),
    /// Frame codec rejected the stream.
    Protocol(ProtocolViolation),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed"),
            Self::WriteOverflow { pending, limit } => {
                write!(f, "write backlog of {} bytes exceeds {}", pending, limit)
            }
            Self::Shutdown => f.write_str("shutdown"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Protocol(v) => write!(f, "protocol violation: {}", v),
        }
    }
}

/// Non-blocking connection with buffered writes.
pub(crate) struct Connection {
    stream: TcpStream,
    decoder: Decoder,
    write_buffer: BytesMut,
    interest: Interest,
    pipeline: Arc<Pipeline>,
    channel: Channel,
}

impl Connection {
    pub fn new(stream: TcpStream, channel: Channel, pipeline: Arc<Pipeline>) -> Self {
        Self {
            stream,
            decoder: pipeline.decoder(),
            write_buffer: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
            interest: Interest::READABLE,
            pipeline,
            channel,
        }
    }

    #[inline(always)]
    fn token(&self) -> Token {
        self.channel.token()
    }

    #[inline]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    #[inline]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let token = self.token();
        registry.register(&mut self.stream, token, self.interest)
    }

    pub fn deregister(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
    }

    /// Read until the socket would block, emitting every complete frame.
    ///
    /// Frames are decoded after each read so an oversized length prefix is
    /// caught before the rest of its payload is buffered.
    pub fn on_readable(&mut self, scratch: &mut [u8]) -> Result<(), CloseReason> {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => {
                    self.drain_frames()?;
                    return Err(CloseReason::PeerClosed);
                }
                Ok(n) => {
                    // Decode per read, jangan tunggu sampai WouldBlock.
                    self.decoder.extend(&scratch[..n]);
                    self.drain_frames()?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CloseReason::Io(e)),
            }
        }
    }

    fn drain_frames(&mut self) -> Result<(), CloseReason> {
        while let Some(frame) = self.decoder.decode().map_err(CloseReason::Protocol)? {
            self.pipeline.fire_frame(&self.channel, frame);
        }
        Ok(())
    }

    /// Queue a frame and write as much as the socket accepts.
    ///
    /// Fails once the unsent backlog would pass the pipeline's limit.
    pub fn queue_write(&mut self, frame: &[u8], registry: &Registry) -> Result<(), CloseReason> {
        let pending = self.write_buffer.len() + frame.len();
        let limit = self.pipeline.max_pending_write();
        if pending > limit {
            return Err(CloseReason::WriteOverflow { pending, limit });
        }
        self.write_buffer.extend_from_slice(frame);
        self.on_writable(registry)
    }

    /// Flush pending bytes and adjust interest to match what is left.
    pub fn on_writable(&mut self, registry: &Registry) -> Result<(), CloseReason> {
        self.flush_write_buffer().map_err(CloseReason::Io)?;
        self.update_interest(registry).map_err(CloseReason::Io)
    }

    fn flush_write_buffer(&mut self) -> io::Result<()> {
        while !self.write_buffer.is_empty() {
            match self.stream.write(&self.write_buffer) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ));
                }
                Ok(n) => self.write_buffer.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn update_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let wanted = if self.write_buffer.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if wanted != self.interest {
            let token = self.token();
            registry.reregister(&mut self.stream, token, wanted)?;
            self.interest = wanted;
        }
        Ok(())
    }

    /// Best-effort flush before an orderly close.
    pub fn flush_before_close(&mut self) {
        let _ = self.flush_write_buffer();
    }

    /// Bytes queued but not yet accepted by the socket.
    #[inline(always)]
    pub fn write_pending(&self) -> usize {
        self.write_buffer.len()
    }
}
