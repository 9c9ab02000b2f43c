//! In-flight invocation tracking
//!
//! Maps correlation ids to their promises. Invoking threads insert, the I/O
//! thread completes; both go through one mutex so an id is either pending or
//! gone, never half-removed.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::promise::Promise;
use crate::error::{Error, Result};
use crate::protocol::{CorrelationId, Response};

/// Pending invocations waiting for their response.
#[derive(Default)]
pub struct PendingInvocations {
    requests: Mutex<HashMap<CorrelationId, Promise<Response>>>,
}

impl PendingInvocations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the promise for `id`. Fails if `id` is still in flight.
    pub fn register(&self, id: CorrelationId) -> Result<Promise<Response>> {
        let mut requests = self.requests.lock();
        if requests.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }
        let promise = Promise::new();
        requests.insert(id, promise.clone());
        Ok(promise)
    }

    /// Deliver a response to its caller. Returns false for unknown ids
    /// (late response after timeout, or a server bug).
    pub fn complete(&self, response: Response) -> bool {
        let promise = self.requests.lock().remove(&response.id);
        match promise {
            Some(promise) => promise.set(response),
            None => false,
        }
    }

    /// Drop the entry without delivering anything. Used on timeout and on
    /// send failure.
    pub fn remove(&self, id: CorrelationId) -> bool {
        self.requests.lock().remove(&id).is_some()
    }

    /// Cancel and remove every pending entry. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.requests.lock().drain().collect();
        let count = drained.len();
        for (_, promise) in drained {
            promise.cancel();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
