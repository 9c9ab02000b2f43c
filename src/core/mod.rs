//! Core module: concurrency primitives under the transport
//!
//! - Lifecycle: one-shot Uninitialized/Started/Stopped state machine
//! - Promise: single-fulfillment cell with deadline-based wait
//! - PendingInvocations: correlation id -> promise map
//! - WorkerPool: dispatch threads for server handlers
//!
//! Semua primitive di sini tanpa I/O; aman dipakai dari thread mana saja.

mod lifecycle;
mod pending;
mod promise;
mod worker_pool;

pub use lifecycle::{Lifecycle, State};
pub use pending::PendingInvocations;
pub use promise::{Outcome, Promise};
pub use worker_pool::WorkerPool;
