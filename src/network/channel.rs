//! Thread-safe handle to one connection
//!
//! The socket itself lives on its I/O thread. Everyone else talks to it
//! through a `Channel`, which just queues commands for that thread.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use mio::Token;

use super::event_loop::{Command, IoHandle};
use crate::error::{Error, Result};

/// Pool-unique connection identifier.
pub type ConnectionId = usize;

/// Addresses and id of a connection, handed to close listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

struct ChannelInner {
    info: ConnectionInfo,
    io: IoHandle,
    closed: AtomicBool,
}

/// Cloneable write handle for a connection.
#[derive(Clone)]
pub(crate) struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("info", &self.inner.info)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(info: ConnectionInfo, io: IoHandle) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                info,
                io,
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[inline]
    pub fn info(&self) -> ConnectionInfo {
        self.inner.info
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.inner.info.id
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.info.peer_addr
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn token(&self) -> Token {
        Token(self.inner.info.id)
    }

    /// Queue an already-encoded frame for writing.
    pub fn write(&self, frame: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        self.inner
            .io
            .send(Command::Write {
                token: self.token(),
                frame,
            })
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Flip to closed. Only the first caller gets `true`.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::AcqRel)
    }
}
