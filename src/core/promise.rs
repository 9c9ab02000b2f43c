//! Single-fulfillment promise with bounded wait
//!
//! Used as the invocation correlator (one per in-flight request) and as the
//! startup completion signal. The first `set` or `cancel` wins; later calls
//! are no-ops. `get` waits against an absolute deadline and re-checks on
//! every wakeup, so spurious wakeups never shorten or extend the wait.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Result of waiting on a [`Promise`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Value delivered by `set`.
    Ready(T),
    /// Deadline passed with nothing delivered.
    TimedOut,
    /// `cancel` was called before any value.
    Cancelled,
}

enum Slot<T> {
    Pending,
    Ready(T),
    Cancelled,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

/// Cloneable handle to a single-fulfillment cell.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.slot.lock() {
            Slot::Pending => "pending",
            Slot::Ready(_) => "ready",
            Slot::Cancelled => "cancelled",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    /// Deliver a value. Returns false if the promise was already completed.
    pub fn set(&self, value: T) -> bool {
        self.complete(Slot::Ready(value))
    }

    /// Complete without a value. Returns false if already completed.
    pub fn cancel(&self) -> bool {
        self.complete(Slot::Cancelled)
    }

    fn complete(&self, outcome: Slot<T>) -> bool {
        let mut slot = self.inner.slot.lock();
        if !matches!(*slot, Slot::Pending) {
            return false;
        }
        *slot = outcome;
        drop(slot);
        self.inner.cond.notify_all();
        true
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.inner.slot.lock(), Slot::Pending)
    }
}

impl<T: Clone> Promise<T> {
    /// Block until completion or until `timeout` elapses.
    pub fn get(&self, timeout: Duration) -> Outcome<T> {
        let deadline = Instant::now().checked_add(timeout);
        let mut slot = self.inner.slot.lock();

        loop {
            match &*slot {
                Slot::Ready(v) => return Outcome::Ready(v.clone()),
                Slot::Cancelled => return Outcome::Cancelled,
                Slot::Pending => {}
            }

            match deadline {
                // Deadline not representable: wait until woken.
                None => self.inner.cond.wait(&mut slot),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Outcome::TimedOut;
                    }
                    // Timeout result is ignored; the loop re-checks both the
                    // slot and the clock.
                    let _ = self.inner.cond.wait_until(&mut slot, deadline);
                }
            }
        }
    }

    /// Non-blocking peek.
    pub fn try_get(&self) -> Option<Outcome<T>> {
        match &*self.inner.slot.lock() {
            Slot::Pending => None,
            Slot::Ready(v) => Some(Outcome::Ready(v.clone())),
            Slot::Cancelled => Some(Outcome::Cancelled),
        }
    }
}
