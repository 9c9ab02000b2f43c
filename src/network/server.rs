//! RPC server with event-driven I/O
//!
//! One acceptor thread polls the listener and hands each accepted socket
//! to an I/O thread. I/O threads decode frames and requests; handlers run
//! on the dispatch pool and write their responses back through the
//! connection's channel.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::channel::ConnectionInfo;
use super::dispatch::{DispatchStage, Handler, Unhandled};
use super::event_loop::IoThreadPool;
use super::options::{ChannelOption, ChannelOptions};
use super::pipeline::{CloseListener, Decode, Encode, Pipeline};
use crate::config::{clamp_io_threads, ServerConfig};
use crate::core::{Lifecycle, Promise, State, WorkerPool};
use crate::error::Result;
use crate::protocol::{FrameCodec, Request, Serializer};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const EVENTS_CAPACITY: usize = 128;

/// RPC server.
///
/// Configure while uninitialized, then `startup()` once. `shutdown()`
/// blocks until every owned thread has exited.
pub struct RpcServer<S: Serializer> {
    config: ServerConfig,
    serializer: Arc<S>,
    handler: Option<Arc<dyn Handler>>,
    close_listeners: Vec<CloseListener>,
    lifecycle: Lifecycle,
    runtime: Mutex<Option<ServerRuntime>>,
}

struct ServerRuntime {
    local_addr: SocketAddr,
    acceptor: Acceptor,
    io: Arc<IoThreadPool>,
    dispatch: Arc<WorkerPool>,
}

impl<S: Serializer> RpcServer<S> {
    /// I/O thread count in `config` is clamped to the hardware default.
    pub fn new(mut config: ServerConfig, serializer: S) -> Self {
        config.io_threads = clamp_io_threads(config.io_threads);
        config.dispatch_threads = config.dispatch_threads.max(1);
        Self {
            config,
            serializer: Arc::new(serializer),
            handler: None,
            close_listeners: Vec::new(),
            lifecycle: Lifecycle::new(),
            runtime: Mutex::new(None),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[inline]
    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().as_ref().map(|rt| rt.local_addr)
    }

    // === Configuration (only before startup) ===

    pub fn set_handler<H: Handler>(&mut self, handler: H) -> Result<()> {
        self.lifecycle.ensure_configurable(&self.config.name)?;
        self.handler = Some(Arc::new(handler));
        Ok(())
    }

    /// Lower the I/O thread count. Returns the effective value, which is
    /// never 0 and never above the hardware default.
    pub fn set_io_threads(&mut self, threads: usize) -> Result<usize> {
        self.lifecycle.ensure_configurable(&self.config.name)?;
        self.config.io_threads = clamp_io_threads(threads);
        Ok(self.config.io_threads)
    }

    pub fn set_dispatch_threads(&mut self, threads: usize) -> Result<usize> {
        self.lifecycle.ensure_configurable(&self.config.name)?;
        self.config.dispatch_threads = threads.max(1);
        Ok(self.config.dispatch_threads)
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

    /// Option for the listening socket.
    pub fn set_option(&mut self, option: ChannelOption) -> Result<()> {
        self.lifecycle.ensure_configurable(&self.config.name)?;
        self.config.options.set(option);
        Ok(())
    }

    /// Option for every accepted connection.
    pub fn set_child_option(&mut self, option: ChannelOption) -> Result<()> {
        self.lifecycle.ensure_configurable(&self.config.name)?;
        self.config.child_options.set(option);
        Ok(())
    }

    /// Called exactly once for each accepted connection when it closes.
    pub fn add_close_listener<F>(&mut self, listener: F) -> Result<()>
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.lifecycle.ensure_configurable(&self.config.name)?;
        self.close_listeners.push(Arc::new(listener));
        Ok(())
    }

    // === Lifecycle ===

    /// Bind, spawn the thread pools and start accepting.
    ///
    /// Bind errors are returned here. The returned signal is fulfilled with
    /// the bound address once the acceptor is polling.
    pub fn startup(&self) -> Result<Promise<SocketAddr>> {
        let mut runtime = self.runtime.lock();
        self.lifecycle.start(&self.config.name)?;

        info!(
            server = %self.config.name,
            io_threads = self.config.io_threads,
            dispatch_threads = self.config.dispatch_threads,
            max_frame_size = self.config.max_frame_size,
            "starting server"
        );

        match self.launch() {
            Ok((rt, ready)) => {
                *runtime = Some(rt);
                Ok(ready)
            }
            Err(e) => {
                self.lifecycle.stop();
                error!(server = %self.config.name, error = %e, "server failed to start");
                Err(e)
            }
        }
    }

    fn launch(&self) -> Result<(ServerRuntime, Promise<SocketAddr>)> {
        let name = &self.config.name;
        let codec = FrameCodec::new(self.config.max_frame_size);

        let dispatch = Arc::new(WorkerPool::spawn(
            &format!("{}-dispatch", name),
            self.config.dispatch_threads,
        )?);

        let handler = match &self.handler {
            Some(handler) => handler.clone(),
            None => {
                warn!(server = %name, "no handler registered, every request will fail");
                Arc::new(Unhandled)
            }
        };

        // codec -> serializer -> dispatch
        let stage = DispatchStage::new(
            handler,
            Encode::new(self.serializer.clone(), codec),
            dispatch.clone(),
        );
        let pipeline = Arc::new(Pipeline::new(
            codec,
            self.config.max_pending_write,
            Decode::<S, Request, _>::new(self.serializer.clone(), stage),
            self.close_listeners.clone(),
        ));

        let listener = TcpListener::bind(self.config.bind_addr)?;
        self.config.options.apply(&listener)?;
        let local_addr = listener.local_addr()?;

        let io = Arc::new(IoThreadPool::spawn(
            &format!("{}-io", name),
            self.config.io_threads,
        )?);

        let ready = Promise::new();
        let acceptor = Acceptor::spawn(
            name,
            listener,
            io.clone(),
            pipeline,
            self.config.child_options.clone(),
            ready.clone(),
        )?;

        Ok((
            ServerRuntime {
                local_addr,
                acceptor,
                io,
                dispatch,
            },
            ready,
        ))
    }

    /// Stop accepting, close every connection and join all threads.
    ///
    /// No-op if the server was never started or is already stopped.
    pub fn shutdown(&self) -> Result<()> {
        if !self.lifecycle.stop() {
            return Ok(());
        }
        info!(server = %self.config.name, "stopping server");

        // Waits for a concurrent startup() to finish installing the runtime.
        let runtime = self.runtime.lock().take();
        if let Some(mut rt) = runtime {
            rt.acceptor.shutdown();
            rt.io.shutdown();
            rt.dispatch.shutdown();
        }

        info!(server = %self.config.name, "server stopped");
        Ok(())
    }
}

impl<S: Serializer> Drop for RpcServer<S> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Listener thread.
struct Acceptor {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl Acceptor {
    fn spawn(
        name: &str,
        mut listener: TcpListener,
        io: Arc<IoThreadPool>,
        pipeline: Arc<Pipeline>,
        child_options: ChannelOptions,
        ready: Promise<SocketAddr>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let stop = Arc::new(AtomicBool::new(false));

        let accept_loop = AcceptLoop {
            name: name.to_string(),
            poll,
            listener,
            io,
            pipeline,
            child_options,
            stop: stop.clone(),
        };
        let thread = thread::Builder::new()
            .name(format!("{}-acceptor", name))
            .spawn(move || accept_loop.run(ready))?;

        Ok(Self {
            stop,
            waker,
            thread: Some(thread),
        })
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("acceptor thread panicked");
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct AcceptLoop {
    name: String,
    poll: Poll,
    listener: TcpListener,
    io: Arc<IoThreadPool>,
    pipeline: Arc<Pipeline>,
    child_options: ChannelOptions,
    stop: Arc<AtomicBool>,
}

impl AcceptLoop {
    fn run(mut self, ready: Promise<SocketAddr>) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        match self.listener.local_addr() {
            Ok(addr) => {
                info!(server = %self.name, %addr, "server listening");
                ready.set(addr);
            }
            Err(e) => {
                error!(server = %self.name, error = %e, "listener has no local address");
                ready.cancel();
                return;
            }
        }

        while !self.stop.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(server = %self.name, error = %e, "acceptor poll failed");
                break;
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_connections();
                }
            }
        }

        debug!(server = %self.name, "acceptor stopped");
        // Dropping the listener closes it.
    }

    /// Accept until the listener would block.
    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.child_options.apply(&stream) {
                        warn!(server = %self.name, %peer, error = %e, "failed to apply channel options");
                    }
                    match self.io.register(stream, self.pipeline.clone(), None) {
                        Ok(channel) => {
                            debug!(server = %self.name, conn = channel.id(), %peer, "accepted connection")
                        }
                        Err(e) => {
                            warn!(server = %self.name, %peer, error = %e, "failed to hand off connection")
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // e.g. EMFILE; retry on the next readiness event.
                    warn!(server = %self.name, error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}
