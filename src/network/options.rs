//! Socket options applied when a connection is built
//!
//! Options are collected before startup and applied once per socket.
//! On unix they go straight to `setsockopt`; elsewhere they are logged and
//! skipped.

use std::collections::BTreeMap;
use std::io;

use tracing::debug;

/// One socket option and its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOption {
    /// Disable Nagle's algorithm.
    TcpNoDelay(bool),
    /// SO_KEEPALIVE.
    KeepAlive(bool),
    /// SO_SNDBUF in bytes.
    SendBufferSize(usize),
    /// SO_RCVBUF in bytes.
    RecvBufferSize(usize),
}

impl ChannelOption {
    /// Stable option name; the option set is keyed by it.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TcpNoDelay(_) => "tcp_nodelay",
            Self::KeepAlive(_) => "so_keepalive",
            Self::SendBufferSize(_) => "so_sndbuf",
            Self::RecvBufferSize(_) => "so_rcvbuf",
        }
    }
}

/// Option name -> value. Setting an option twice keeps the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    entries: BTreeMap<&'static str, ChannelOption>,
}

impl ChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the previous value for that name.
    pub fn set(&mut self, option: ChannelOption) -> Option<ChannelOption> {
        self.entries.insert(option.name(), option)
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, option: ChannelOption) -> Self {
        self.set(option);
        self
    }

    pub fn get(&self, name: &str) -> Option<ChannelOption> {
        self.entries.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelOption> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply every option to `socket`. Stops at the first failure.
    #[cfg(unix)]
    pub fn apply<S: std::os::unix::io::AsRawFd>(&self, socket: &S) -> io::Result<()> {
        let fd = socket.as_raw_fd();
        for option in self.iter() {
            debug!(option = option.name(), ?option, "applying channel option");
            match *option {
                ChannelOption::TcpNoDelay(on) => {
                    sys::setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)?
                }
                ChannelOption::KeepAlive(on) => {
                    sys::setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as libc::c_int)?
                }
                ChannelOption::SendBufferSize(size) => {
                    sys::setsockopt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, sys::clamp(size))?
                }
                ChannelOption::RecvBufferSize(size) => {
                    sys::setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, sys::clamp(size))?
                }
            }
        }
        Ok(())
    }

    /// Socket options are only wired up through `setsockopt` on unix.
    #[cfg(not(unix))]
    pub fn apply<S>(&self, _socket: &S) -> io::Result<()> {
        for option in self.iter() {
            debug!(option = option.name(), "channel option unsupported on this platform");
        }
        Ok(())
    }
}

#[cfg(unix)]
mod sys {
    use std::io;
    use std::os::unix::io::RawFd;

    pub(super) fn clamp(size: usize) -> libc::c_int {
        size.min(libc::c_int::MAX as usize) as libc::c_int
    }

    pub(super) fn setsockopt(
        fd: RawFd,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
    ) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
