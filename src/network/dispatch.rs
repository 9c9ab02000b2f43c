//! Server-side dispatch
//!
//! Decoded requests are handed to the worker pool, run through the user's
//! [`Handler`], and the response goes back out through the same pipeline.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::channel::Channel;
use super::pipeline::{Encode, MessageHandler};
use crate::core::WorkerPool;
use crate::protocol::{Request, Response, Serializer};

/// Business logic for a server: one request in, one response out.
///
/// Called concurrently from the dispatch pool; any shared state is the
/// implementor's to synchronize.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> Response;
}

impl<F> Handler for F
where
    F: Fn(Request) -> Response + Send + Sync + 'static,
{
    fn handle(&self, request: Request) -> Response {
        self(request)
    }
}

/// Used when a server is started without a handler.
pub(crate) struct Unhandled;

impl Handler for Unhandled {
    fn handle(&self, request: Request) -> Response {
        Response::error(request.id, "no handler registered")
    }
}

/// Business stage of the server pipeline.
pub(crate) struct DispatchStage<S> {
    inner: Arc<Dispatcher<S>>,
}

struct Dispatcher<S> {
    handler: Arc<dyn Handler>,
    outbound: Encode<S>,
    pool: Arc<WorkerPool>,
}

impl<S: Serializer> DispatchStage<S> {
    pub fn new(handler: Arc<dyn Handler>, outbound: Encode<S>, pool: Arc<WorkerPool>) -> Self {
        Self {
            inner: Arc::new(Dispatcher {
                handler,
                outbound,
                pool,
            }),
        }
    }
}

impl<S: Serializer> MessageHandler<Request> for DispatchStage<S> {
    fn on_message(&self, channel: &Channel, request: Request) {
        let id = request.id;
        let dispatcher = self.inner.clone();
        let channel = channel.clone();
        let queued = self
            .inner
            .pool
            .execute(move || dispatcher.dispatch(&channel, request));
        if !queued {
            debug!(id, "dispatch pool stopped, dropping request");
        }
    }
}

impl<S: Serializer> Dispatcher<S> {
    fn dispatch(&self, channel: &Channel, request: Request) {
        let response = invoke(&*self.handler, request);
        self.reply(channel, response);
    }

    fn reply(&self, channel: &Channel, response: Response) {
        let id = response.id;
        let frame = match self.outbound.frame(&response) {
            Ok(frame) => frame,
            Err(e) => {
                // Tell the caller instead of leaving it to time out.
                warn!(id, error = %e, "response could not be encoded");
                match self.outbound.frame(&Response::error(id, e.to_string())) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(id, error = %e, "error response could not be encoded");
                        return;
                    }
                }
            }
        };

        if let Err(e) = channel.write(frame) {
            debug!(id, conn = channel.id(), error = %e, "response dropped");
        }
    }
}

/// Run the handler, isolating panics and pinning the correlation id.
pub(crate) fn invoke(handler: &dyn Handler, request: Request) -> Response {
    let id = request.id;
    let operation = request.operation.clone();

    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
        Ok(mut response) => {
            if response.id != id {
                warn!(expected = id, got = response.id, %operation, "handler changed correlation id");
                response.id = id;
            }
            response
        }
        Err(_) => {
            warn!(id, %operation, "handler panicked");
            Response::error(id, format!("handler for `{}` panicked", operation))
        }
    }
}
