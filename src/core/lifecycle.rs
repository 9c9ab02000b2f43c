//! One-shot lifecycle state machine
//!
//! `Uninitialized -> Started -> Stopped`, each edge taken at most once.
//! Transitions are a single compare-exchange so concurrent `startup()`
//! callers race safely: exactly one wins, the rest get `DoubleInit`.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};

/// Lifecycle state of a client or server instance.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Configurable, not yet running.
    Uninitialized = 0,
    /// Running; configuration frozen.
    Started = 1,
    /// Shut down; cannot be restarted.
    Stopped = 2,
}

impl State {
    #[inline(always)]
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Uninitialized,
            1 => Self::Started,
            _ => Self::Stopped,
        }
    }
}

/// Atomic lifecycle cell shared by the client and server managers.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(State::Uninitialized as u8),
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Take the `Uninitialized -> Started` edge.
    ///
    /// Fails with `DoubleInit` from any other state and changes nothing.
    pub fn start(&self, name: &str) -> Result<()> {
        self.state
            .compare_exchange(
                State::Uninitialized as u8,
                State::Started as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| Error::DoubleInit(name.to_string()))
    }

    /// Take the `Started -> Stopped` edge. Only the caller that gets `true`
    /// performs teardown; stopping an uninitialized instance is a no-op.
    pub fn stop(&self) -> bool {
        self.state
            .compare_exchange(
                State::Started as u8,
                State::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Gate for configuration setters.
    #[inline]
    pub fn ensure_configurable(&self, name: &str) -> Result<()> {
        match self.state() {
            State::Uninitialized => Ok(()),
            _ => Err(Error::FrozenConfig(name.to_string())),
        }
    }

    #[inline]
    pub fn ensure_started(&self, name: &str) -> Result<()> {
        match self.state() {
            State::Started => Ok(()),
            _ => Err(Error::NotStarted(name.to_string())),
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_start_once() {
        let lc = Lifecycle::new();
        assert!(lc.start("svc").is_ok());
        assert!(matches!(lc.start("svc"), Err(Error::DoubleInit(_))));
        assert_eq!(lc.state(), State::Started);
    }

    #[test]
    fn test_no_restart_after_stop() {
        let lc = Lifecycle::new();
        lc.start("svc").unwrap();
        assert!(lc.stop());
        assert!(!lc.stop());
        assert_eq!(lc.state(), State::Stopped);
        assert!(matches!(lc.start("svc"), Err(Error::DoubleInit(_))));
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let lc = Lifecycle::new();
        assert!(!lc.stop());
        assert_eq!(lc.state(), State::Uninitialized);
        assert!(lc.start("svc").is_ok());
    }

    #[test]
    fn test_config_frozen_after_start() {
        let lc = Lifecycle::new();
        assert!(lc.ensure_configurable("svc").is_ok());
        lc.start("svc").unwrap();
        assert!(matches!(
            lc.ensure_configurable("svc"),
            Err(Error::FrozenConfig(_))
        ));
    }

    #[test]
    fn test_concurrent_start_single_winner() {
        let lc = Arc::new(Lifecycle::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lc = lc.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    if lc.start("svc").is_ok() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
