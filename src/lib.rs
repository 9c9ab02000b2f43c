//! Courier - length-framed RPC transport
//!
//! A client sends a [`Request`] over one TCP connection and blocks until the
//! [`Response`] carrying the same correlation id comes back, or until its
//! timeout elapses. The server decodes requests on mio event-loop threads and
//! runs the user's [`Handler`] on a dispatch pool, so responses may complete
//! in any order.
//!
//! Architecture:
//! - `protocol`: frame codec, envelopes, pluggable serializers
//! - `core`: lifecycle, promise, pending-invocation map, worker pool
//! - `network`: I/O threads, connection pipeline, `RpcServer` / `RpcClient`
//!
//! ```no_run
//! use std::time::Duration;
//! use courier::{ClientConfig, MsgPackSerializer, Request, Response, RpcClient, RpcServer, ServerConfig};
//!
//! # fn main() -> courier::Result<()> {
//! let mut server = RpcServer::new(
//!     ServerConfig::new("echo", "127.0.0.1:9999".parse().unwrap()),
//!     MsgPackSerializer,
//! );
//! server.set_handler(|req: Request| Response::ok(req.id, req.payload))?;
//! server.startup()?;
//!
//! let client = RpcClient::new(
//!     ClientConfig::new("caller", "127.0.0.1:9999".parse().unwrap()),
//!     MsgPackSerializer,
//! );
//! client.startup()?;
//! let response = client.call("echo", "ping", Duration::from_millis(500))?;
//! assert_eq!(&response.payload[..], b"ping");
//!
//! client.shutdown()?;
//! server.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod protocol;

pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, ProtocolViolation, Result, SerializationError};
pub use network::{ChannelOption, ChannelOptions, ConnectionInfo, Handler, RpcClient, RpcServer};
pub use protocol::{FrameCodec, JsonSerializer, MsgPackSerializer, Request, Response, Serializer};
