//! Connection pipeline
//!
//! Every connection, client or server, runs the same ordered stages:
//!
//! ```text
//! inbound:  bytes -> [frame codec] -> frame -> [Decode<S>] -> message -> [business stage]
//! outbound: message -> [Encode<S>] -> serializer bytes -> [frame codec] -> frame -> socket
//! ```
//!
//! The frame codec stage is stateful per connection and lives in
//! `Connection`; the rest are shared across connections.

use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::channel::{Channel, ConnectionInfo};
use crate::error::Result;
use crate::protocol::{Decoder, FrameCodec, Serializer};

/// Notification fired once per closed connection.
pub(crate) type CloseListener = Arc<dyn Fn(&ConnectionInfo) + Send + Sync>;

/// Stage fed with complete frames by the I/O thread.
pub(crate) trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, channel: &Channel, frame: Bytes);

    fn on_close(&self, _channel: &Channel) {}
}

/// Stage fed with decoded messages.
pub(crate) trait MessageHandler<M>: Send + Sync + 'static {
    fn on_message(&self, channel: &Channel, message: M);

    fn on_close(&self, _channel: &Channel) {}
}

/// Assembled, immutable pipeline shared by every connection of one
/// client or server.
pub(crate) struct Pipeline {
    codec: FrameCodec,
    max_pending_write: usize,
    handler: Box<dyn FrameHandler>,
    close_listeners: Vec<CloseListener>,
}

impl Pipeline {
    pub fn new<H: FrameHandler>(
        codec: FrameCodec,
        max_pending_write: usize,
        handler: H,
        close_listeners: Vec<CloseListener>,
    ) -> Self {
        Self {
            codec,
            max_pending_write,
            handler: Box::new(handler),
            close_listeners,
        }
    }

    /// Per-connection decoder for the codec stage.
    pub(crate) fn decoder(&self) -> Decoder {
        self.codec.decoder()
    }

    /// Unsent bytes a connection may hold before it is dropped.
    #[inline]
    pub(crate) fn max_pending_write(&self) -> usize {
        self.max_pending_write
    }

    #[inline]
    pub(crate) fn fire_frame(&self, channel: &Channel, frame: Bytes) {
        self.handler.on_frame(channel, frame);
    }

    /// Stages first, then user listeners.
    ///
    /// Runs on the I/O thread. A panic in one callback is logged and does
    /// not stop the others or the thread.
    pub(crate) fn fire_close(&self, channel: &Channel) {
        let info = channel.info();
        if panic::catch_unwind(AssertUnwindSafe(|| self.handler.on_close(channel))).is_err() {
            warn!(conn = info.id, "close stage panicked");
        }
        for (index, listener) in self.close_listeners.iter().enumerate() {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(&info))).is_err() {
                warn!(conn = info.id, peer = %info.peer_addr, listener = index, "close listener panicked");
            }
        }
    }
}

/// Serializer adaptation stage: frame -> `M`.
///
/// An undecodable frame is logged and dropped; the connection and the
/// decoder state for later frames are unaffected.
pub(crate) struct Decode<S, M, H> {
    serializer: Arc<S>,
    next: H,
    _message: PhantomData<fn() -> M>,
}

impl<S, M, H> Decode<S, M, H> {
    pub fn new(serializer: Arc<S>, next: H) -> Self {
        Self {
            serializer,
            next,
            _message: PhantomData,
        }
    }
}

impl<S, M, H> FrameHandler for Decode<S, M, H>
where
    S: Serializer,
    M: DeserializeOwned + 'static,
    H: MessageHandler<M>,
{
    fn on_frame(&self, channel: &Channel, frame: Bytes) {
        match self.serializer.decode::<M>(&frame) {
            Ok(message) => self.next.on_message(channel, message),
            Err(e) => warn!(
                conn = channel.id(),
                len = frame.len(),
                error = %e,
                "dropping undecodable message"
            ),
        }
    }

    fn on_close(&self, channel: &Channel) {
        self.next.on_close(channel);
    }
}

/// Outbound half: serializer then frame codec.
pub(crate) struct Encode<S> {
    serializer: Arc<S>,
    codec: FrameCodec,
}

impl<S> Clone for Encode<S> {
    fn clone(&self) -> Self {
        Self {
            serializer: self.serializer.clone(),
            codec: self.codec,
        }
    }
}

impl<S: Serializer> Encode<S> {
    pub fn new(serializer: Arc<S>, codec: FrameCodec) -> Self {
        Self { serializer, codec }
    }

    /// Encode `message` into a wire-ready frame.
    ///
    /// Oversized payloads fail here, before anything reaches the socket.
    pub fn frame<T: Serialize>(&self, message: &T) -> Result<Bytes> {
        let payload = self.serializer.encode(message)?;
        Ok(self.codec.encode(&payload)?)
    }
}
