//! Client and server configuration
//!
//! Plain structs with sensible defaults. The lifecycle managers own their
//! config and only let it change before `startup()`.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use crate::network::{ChannelOption, ChannelOptions};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

/// Minimum dispatch pool size, independent of core count, so a few slow
/// handlers cannot starve the rest on small machines.
const MIN_DISPATCH_THREADS: usize = 4;

/// Default cap on unsent bytes per connection. A peer that stops reading
/// is disconnected once its backlog passes this.
pub const DEFAULT_MAX_PENDING_WRITE: usize = 16 * 1024 * 1024;

/// Hardware-derived default for I/O thread pools.
pub fn default_io_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Clamp a requested I/O thread count into `1..=default_io_threads()`.
///
/// Counts can be lowered relative to the hardware default but never raised.
pub fn clamp_io_threads(requested: usize) -> usize {
    requested.min(default_io_threads()).max(1)
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Instance name, used for thread names and logs.
    pub name: String,
    pub bind_addr: SocketAddr,
    /// Event-loop threads serving accepted connections.
    pub io_threads: usize,
    /// Threads running the request handler.
    pub dispatch_threads: usize,
    /// Shared encode/decode payload limit.
    pub max_frame_size: usize,
    /// Per-connection write backlog limit in bytes.
    pub max_pending_write: usize,
    /// Applied to the listening socket.
    pub options: ChannelOptions,
    /// Applied to every accepted connection.
    pub child_options: ChannelOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "courier-server".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9999)),
            io_threads: default_io_threads(),
            dispatch_threads: default_io_threads().max(MIN_DISPATCH_THREADS),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_pending_write: DEFAULT_MAX_PENDING_WRITE,
            options: ChannelOptions::new(),
            child_options: ChannelOptions::new().with(ChannelOption::TcpNoDelay(true)),
        }
    }
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            bind_addr,
            ..Self::default()
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Instance name, used for thread names and logs.
    pub name: String,
    pub server_addr: SocketAddr,
    pub io_threads: usize,
    /// Shared encode/decode payload limit.
    pub max_frame_size: usize,
    pub max_pending_write: usize,
    /// `None` uses the OS connect timeout.
    pub connect_timeout: Option<Duration>,
    pub options: ChannelOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "courier-client".to_string(),
            server_addr: SocketAddr::from(([127, 0, 0, 1], 9999)),
            io_threads: default_io_threads(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_pending_write: DEFAULT_MAX_PENDING_WRITE,
            connect_timeout: Some(Duration::from_secs(5)),
            options: ChannelOptions::new().with(ChannelOption::TcpNoDelay(true)),
        }
    }
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, server_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            server_addr,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_zero_to_one() {
        assert_eq!(clamp_io_threads(0), 1);
    }

    #[test]
    fn test_clamp_never_above_default() {
        assert_eq!(clamp_io_threads(usize::MAX), default_io_threads());
        assert_eq!(clamp_io_threads(default_io_threads() + 1), default_io_threads());
    }

    #[test]
    fn test_clamp_lowering_allowed() {
        assert_eq!(clamp_io_threads(1), 1);
    }

    #[test]
    fn test_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.max_frame_size, 65535);
        assert!(server.max_pending_write > server.max_frame_size);
        assert!(server.dispatch_threads >= 4);
        assert_eq!(
            server.child_options.get("tcp_nodelay"),
            Some(ChannelOption::TcpNoDelay(true))
        );

        let client = ClientConfig::new("c", "127.0.0.1:1".parse().unwrap());
        assert_eq!(client.name, "c");
        assert_eq!(client.io_threads, default_io_threads());
    }
}
