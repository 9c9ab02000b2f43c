//! RPC client
//!
//! One connection, one I/O thread pool. `invoke` blocks only on its own
//! pending promise; the I/O thread fulfills it when a response with the
//! matching id arrives, in whatever order the server answers.

use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::channel::{Channel, ConnectionInfo};
use super::event_loop::IoThreadPool;
use super::options::ChannelOption;
use super::pipeline::{CloseListener, Decode, Encode, MessageHandler, Pipeline};
use crate::config::{clamp_io_threads, ClientConfig};
use crate::core::{Lifecycle, Outcome, PendingInvocations, Promise, State};
use crate::error::{Error, Result};
use crate::protocol::{CorrelationId, FrameCodec, Request, Response, Serializer};

/// Blocking request/response client over a single connection.
pub struct RpcClient<S: Serializer> {
    config: ClientConfig,
    serializer: Arc<S>,
    close_listeners: Vec<CloseListener>,
    lifecycle: Lifecycle,
    pending: Arc<PendingInvocations>,
    next_id: AtomicU64,
    runtime: Mutex<Option<ClientRuntime<S>>>,
}

struct ClientRuntime<S> {
    io: IoThreadPool,
    channel: Channel,
    outbound: Encode<S>,
}

impl<S: Serializer> RpcClient<S> {
    pub fn new(mut config: ClientConfig, serializer: S) -> Self {
        config.io_threads = clamp_io_threads(config.io_threads);
        Self {
            config,
            serializer: Arc::new(serializer),
            close_listeners: Vec::new(),
            lifecycle: Lifecycle::new(),
            pending: Arc::new(PendingInvocations::new()),
            next_id: AtomicU64::new(1),
            runtime: Mutex::new(None),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[inline]
    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// Invocations still waiting for a response.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Connection details while connected.
    pub fn connection(&self) -> Option<ConnectionInfo> {
        self.runtime.lock().as_ref().map(|rt| rt.channel.info())
    }

    // === Configuration (only before startup) ===

    pub fn set_io_threads(&mut self, threads: usize) -> Result<usize> {
        self.lifecycle.ensure_configurable(&self.config.name)?;
        self.config.io_threads = clamp_io_threads(threads);
        Ok(self.config.io_threads)
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: usize) -> Result<()> {
        self.lifecycle.ensure_configurable(&self.config.name)?;
        self.config.max_frame_size = max_frame_size;
        Ok(())
    }

    /// Unsent bytes a connection may queue before it is closed.
    pub fn set_max_pending_write(&mut self, bytes: usize) -> Result<()> {
        self.lifecycle.ensure_configurable(&self.config.name)?;
        self.config.max_pending_write = bytes;
        Ok(())
    }

    pub fn set_connect_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.lifecycle.ensure_configurable(&self.config.name)?;
        self.config.connect_timeout = timeout;
        Ok(())
    }

    pub fn set_option(&mut self, option: ChannelOption) -> Result<()> {
        self.lifecycle.ensure_configurable(&self.config.name)?;
        self.config.options.set(option);
        Ok(())
    }

    /// Called exactly once when the connection closes.
    pub fn add_close_listener<F>(&mut self, listener: F) -> Result<()>
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.lifecycle.ensure_configurable(&self.config.name)?;
        self.close_listeners.push(Arc::new(listener));
        Ok(())
    }

    // === Lifecycle ===

    /// Connect to the server.
    ///
    /// Connect errors are returned here. The returned signal is fulfilled
    /// with the local address once the I/O thread has adopted the socket.
    pub fn startup(&self) -> Result<Promise<SocketAddr>> {
        let mut runtime = self.runtime.lock();
        self.lifecycle.start(&self.config.name)?;

        info!(
            client = %self.config.name,
            server = %self.config.server_addr,
            io_threads = self.config.io_threads,
            "starting client"
        );

        match self.connect() {
            Ok((rt, ready)) => {
                *runtime = Some(rt);
                Ok(ready)
            }
            Err(e) => {
                self.lifecycle.stop();
                error!(client = %self.config.name, error = %e, "client failed to start");
                Err(e)
            }
        }
    }

    fn connect(&self) -> Result<(ClientRuntime<S>, Promise<SocketAddr>)> {
        let addr = self.config.server_addr;
        let stream = match self.config.connect_timeout {
            Some(timeout) => StdTcpStream::connect_timeout(&addr, timeout)?,
            None => StdTcpStream::connect(addr)?,
        };
        self.config.options.apply(&stream)?;
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(stream);

        let codec = FrameCodec::new(self.config.max_frame_size);
        let pipeline = Arc::new(Pipeline::new(
            codec,
            self.config.max_pending_write,
            Decode::<S, Response, _>::new(
                self.serializer.clone(),
                Correlate {
                    pending: self.pending.clone(),
                },
            ),
            self.close_listeners.clone(),
        ));

        let io = IoThreadPool::spawn(&format!("{}-io", self.config.name), self.config.io_threads)?;
        let ready = Promise::new();
        let channel = io.register(stream, pipeline, Some(ready.clone()))?;
        debug!(client = %self.config.name, conn = channel.id(), "connected");

        Ok((
            ClientRuntime {
                io,
                channel,
                outbound: Encode::new(self.serializer.clone(), codec),
            },
            ready,
        ))
    }

    /// Build a request with a fresh correlation id.
    pub fn request(&self, operation: impl Into<String>, payload: impl Into<Bytes>) -> Request {
        Request::new(self.next_id(), operation, payload)
    }

    fn next_id(&self) -> CorrelationId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send `request` and block until its response arrives or `timeout`
    /// elapses.
    ///
    /// On timeout the pending entry is removed and `TimedOut` returned; a
    /// response arriving later is discarded. The server is not told.
    pub fn invoke(&self, request: Request, timeout: Duration) -> Result<Response> {
        self.lifecycle.ensure_started(&self.config.name)?;

        let (channel, outbound) = match self.runtime.lock().as_ref() {
            Some(rt) => (rt.channel.clone(), rt.outbound.clone()),
            None => return Err(Error::NotStarted(self.config.name.clone())),
        };

        let id = request.id;
        // Oversized or unencodable requests fail before anything is tracked.
        let frame = outbound.frame(&request)?;

        let promise = self.pending.register(id)?;
        // A close that raced the registration has already run cancel_all.
        if !channel.is_open() {
            self.pending.remove(id);
            return Err(Error::ConnectionClosed);
        }
        if let Err(e) = channel.write(frame) {
            self.pending.remove(id);
            return Err(e);
        }

        match promise.get(timeout) {
            Outcome::Ready(response) => Ok(response),
            Outcome::TimedOut => {
                self.pending.remove(id);
                debug!(client = %self.config.name, id, ?timeout, "invocation timed out");
                Err(Error::TimedOut { id, timeout })
            }
            Outcome::Cancelled => {
                if channel.is_open() {
                    Err(Error::Cancelled(id))
                } else {
                    Err(Error::ConnectionClosed)
                }
            }
        }
    }

    /// `invoke` with a freshly built request.
    pub fn call(
        &self,
        operation: impl Into<String>,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Response> {
        self.invoke(self.request(operation, payload), timeout)
    }

    /// Close the connection, stop the I/O threads and fail every waiting
    /// invocation. Blocks until the I/O threads have exited.
    pub fn shutdown(&self) -> Result<()> {
        if !self.lifecycle.stop() {
            return Ok(());
        }
        info!(client = %self.config.name, "stopping client");

        let runtime = self.runtime.lock().take();
        if let Some(rt) = runtime {
            rt.io.shutdown();
        }

        let cancelled = self.pending.cancel_all();
        if cancelled > 0 {
            debug!(client = %self.config.name, cancelled, "cancelled pending invocations");
        }
        info!(client = %self.config.name, "client stopped");
        Ok(())
    }
}

impl<S: Serializer> Drop for RpcClient<S> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Business stage of the client pipeline: hands responses to waiters.
struct Correlate {
    pending: Arc<PendingInvocations>,
}

impl MessageHandler<Response> for Correlate {
    fn on_message(&self, channel: &Channel, response: Response) {
        let id = response.id;
        if !self.pending.complete(response) {
            // Timed out already, or never ours.
            debug!(conn = channel.id(), id, "discarding unmatched response");
        }
    }

    fn on_close(&self, channel: &Channel) {
        let cancelled = self.pending.cancel_all();
        if cancelled > 0 {
            warn!(
                conn = channel.id(),
                peer = %channel.peer_addr(),
                cancelled,
                "connection closed with invocations in flight"
            );
        }
    }
}
