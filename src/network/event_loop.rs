//! I/O thread pool
//!
//! Each I/O thread owns a mio `Poll`, a command queue and the connections
//! assigned to it. Other threads never touch sockets directly: they push a
//! [`Command`] and wake the poll.
//!
//! Token layout per thread:
//! - `Token(0)`: waker
//! - `Token(id)`: connection `id` (pool-unique, starts at 1)

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::channel::{Channel, ConnectionInfo};
use super::connection::{CloseReason, Connection, READ_BUFFER_SIZE};
use super::pipeline::Pipeline;
use crate::core::Promise;

const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

/// Work for an I/O thread.
pub(crate) enum Command {
    /// Adopt a connected socket. `ready` gets the local address once the
    /// socket is registered.
    Register {
        stream: TcpStream,
        channel: Channel,
        pipeline: Arc<Pipeline>,
        ready: Option<Promise<SocketAddr>>,
    },
    Write {
        token: Token,
        frame: Bytes,
    },
    Shutdown,
}

/// Sending side of one I/O thread's queue.
#[derive(Clone)]
pub(crate) struct IoHandle {
    commands: Sender<Command>,
    waker: Arc<Waker>,
}

impl IoHandle {
    pub fn send(&self, command: Command) -> io::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "I/O thread stopped"))?;
        self.waker.wake()
    }
}

/// Fixed set of I/O threads; connections are assigned round-robin.
pub(crate) struct IoThreadPool {
    name: String,
    handles: Vec<IoHandle>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_thread: AtomicUsize,
    next_id: AtomicUsize,
}

impl IoThreadPool {
    /// Spawn `size` event-loop threads named `{name}-{index}`.
    pub fn spawn(name: &str, size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let mut handles = Vec::with_capacity(size);
        let mut threads = Vec::with_capacity(size);

        for index in 0..size {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
            let (sender, receiver) = mpsc::channel();

            let thread_name = format!("{}-{}", name, index);
            let worker = IoThread {
                name: thread_name.clone(),
                poll,
                commands: receiver,
                connections: HashMap::new(),
                scratch: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            };
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker.run())?;

            handles.push(IoHandle {
                commands: sender,
                waker,
            });
            threads.push(handle);
        }

        debug!(pool = name, size, "I/O threads started");

        Ok(Self {
            name: name.to_string(),
            handles,
            threads: Mutex::new(threads),
            next_thread: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        })
    }

    /// Hand a connected socket to the next I/O thread.
    ///
    /// The returned channel is usable immediately; writes queued before the
    /// thread processes the registration are applied in order after it.
    pub fn register(
        &self,
        stream: TcpStream,
        pipeline: Arc<Pipeline>,
        ready: Option<Promise<SocketAddr>>,
    ) -> io::Result<Channel> {
        let info = ConnectionInfo {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            local_addr: stream.local_addr()?,
            peer_addr: stream.peer_addr()?,
        };
        let index = self.next_thread.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        let handle = &self.handles[index];

        let channel = Channel::new(info, handle.clone());
        handle.send(Command::Register {
            stream,
            channel: channel.clone(),
            pipeline,
            ready,
        })?;
        Ok(channel)
    }

    /// Stop every I/O thread and wait for all of them to exit.
    ///
    /// Open connections are closed and their close notifications fired
    /// before this returns.
    pub fn shutdown(&self) {
        for handle in &self.handles {
            let _ = handle.send(Command::Shutdown);
        }
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        if threads.is_empty() {
            return;
        }
        for thread in threads {
            if thread.join().is_err() {
                warn!(pool = %self.name, "I/O thread panicked");
            }
        }
        debug!(pool = %self.name, "I/O threads stopped");
    }
}

impl Drop for IoThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One event loop.
struct IoThread {
    name: String,
    poll: Poll,
    commands: Receiver<Command>,
    connections: HashMap<Token, Connection>,
    scratch: Box<[u8]>,
}

impl IoThread {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(thread = %self.name, error = %e, "poll failed, stopping I/O thread");
                break;
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    // Commands are drained below on every iteration.
                    continue;
                }
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    self.handle_read(token);
                }
                if event.is_writable() {
                    self.handle_write(token);
                }
            }

            if !self.drain_commands() {
                break;
            }
        }

        self.close_all();
    }

    /// Returns false when the thread should stop.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Register {
                    stream,
                    channel,
                    pipeline,
                    ready,
                }) => self.adopt(stream, channel, pipeline, ready),
                Ok(Command::Write { token, frame }) => self.handle_queue_write(token, &frame),
                Ok(Command::Shutdown) => return false,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn adopt(
        &mut self,
        stream: TcpStream,
        channel: Channel,
        pipeline: Arc<Pipeline>,
        ready: Option<Promise<SocketAddr>>,
    ) {
        let token = channel.token();
        let info = channel.info();
        let mut conn = Connection::new(stream, channel, pipeline);

        if let Err(e) = conn.register(self.poll.registry()) {
            error!(thread = %self.name, conn = info.id, error = %e, "failed to register connection");
            if let Some(ready) = ready {
                ready.cancel();
            }
            if conn.channel().mark_closed() {
                conn.pipeline().fire_close(conn.channel());
            }
            return;
        }

        debug!(
            thread = %self.name,
            conn = info.id,
            local = %info.local_addr,
            peer = %info.peer_addr,
            "connection registered"
        );
        self.connections.insert(token, conn);

        if let Some(ready) = ready {
            ready.set(info.local_addr);
        }
    }

    fn handle_read(&mut self, token: Token) {
        let result = match self.connections.get_mut(&token) {
            Some(conn) => conn.on_readable(&mut self.scratch),
            None => return,
        };
        if let Err(reason) = result {
            self.close(token, reason);
        }
    }

    fn handle_write(&mut self, token: Token) {
        let result = match self.connections.get_mut(&token) {
            Some(conn) => conn.on_writable(self.poll.registry()),
            None => return,
        };
        if let Err(reason) = result {
            self.close(token, reason);
        }
    }

    fn handle_queue_write(&mut self, token: Token, frame: &[u8]) {
        let result = match self.connections.get_mut(&token) {
            Some(conn) => conn.queue_write(frame, self.poll.registry()),
            // Already closed; the writer finds out through `Channel::is_open`.
            None => return,
        };
        if let Err(reason) = result {
            self.close(token, reason);
        }
    }

    /// Remove, deregister and notify. Runs at most once per connection.
    fn close(&mut self, token: Token, reason: CloseReason) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        conn.deregister(self.poll.registry());

        let info = conn.channel().info();
        match &reason {
            CloseReason::Protocol(_) | CloseReason::Io(_) | CloseReason::WriteOverflow { .. } => warn!(
                thread = %self.name,
                conn = info.id,
                peer = %info.peer_addr,
                reason = %reason,
                "connection closed on error"
            ),
            _ => debug!(
                thread = %self.name,
                conn = info.id,
                peer = %info.peer_addr,
                reason = %reason,
                unsent = conn.write_pending(),
                "connection closed"
            ),
        }

        if conn.channel().mark_closed() {
            conn.pipeline().fire_close(conn.channel());
        }
        // Dropping `conn` closes the socket.
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            if let Some(conn) = self.connections.get_mut(&token) {
                conn.flush_before_close();
            }
            self.close(token, CloseReason::Shutdown);
        }

        // Sockets handed over after the shutdown command never got adopted.
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Register {
                channel,
                pipeline,
                ready,
                ..
            } = command
            {
                if let Some(ready) = ready {
                    ready.cancel();
                }
                if channel.mark_closed() {
                    pipeline.fire_close(&channel);
                }
            }
        }
        debug!(thread = %self.name, "I/O thread stopped");
    }
}
