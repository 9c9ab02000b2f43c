//! Network layer: mio event loops and the RPC managers
//!
//! - `event_loop`: I/O thread pool, one `Poll` per thread
//! - `connection`: per-socket read/write state, owned by its I/O thread
//! - `channel`: thread-safe handle to a connection
//! - `pipeline`: codec -> serializer -> business stages
//! - `server` / `client`: lifecycle managers
//!
//! Catatan: socket hanya disentuh oleh I/O thread pemiliknya. Thread lain
//! cukup mengirim command lewat `Channel`.

mod channel;
mod client;
mod connection;
mod dispatch;
mod event_loop;
mod options;
mod pipeline;
mod server;

pub use channel::{ConnectionId, ConnectionInfo};
pub use client::RpcClient;
pub use dispatch::Handler;
pub use options::{ChannelOption, ChannelOptions};
pub use server::RpcServer;
