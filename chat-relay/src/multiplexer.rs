//! Waits until registered endpoints become readable.

use std::{
    future::poll_fn,
    io,
    task::{Context, Poll},
    time::Duration,
};

use tokio::time;

use crate::{
    endpoint::{EndpointId, Role},
    registry::Registry,
};

#[derive(Debug)]
pub enum Event {
    Readable,
    Error(io::Error),
}

#[derive(Debug)]
pub struct Readiness {
    pub id: EndpointId,
    pub role: Role,
    pub event: Event,
}

#[derive(Debug, Clone, Copy)]
pub struct Multiplexer {
    timeout: Duration,
}

impl Multiplexer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Blocks until at least one endpoint is ready or the timeout elapses.
    ///
    /// Returns readiness in registry order; an elapsed timeout yields an
    /// empty set. A failure on the listener or the control channel is
    /// returned as `Err`, while a failing client is reported as
    /// [`Event::Error`] so only that client needs to go.
    ///
    /// Cancel safe: nothing is consumed from any endpoint except a parked
    /// listener connection, which stays parked for the next call.
    pub async fn poll(&self, registry: &mut Registry) -> io::Result<Vec<Readiness>> {
        match time::timeout(self.timeout, poll_fn(|cx| poll_registry(registry, cx))).await {
            Ok(result) => result,
            Err(_elapsed) => Ok(Vec::new()),
        }
    }
}

fn poll_registry(registry: &mut Registry, cx: &mut Context<'_>) -> Poll<io::Result<Vec<Readiness>>> {
    let mut ready = Vec::new();

    for (id, endpoint) in registry.iter_mut() {
        let role = endpoint.role();
        match endpoint.poll_ready(cx) {
            Poll::Ready(Ok(())) => ready.push(Readiness {
                id,
                role,
                event: Event::Readable,
            }),
            Poll::Ready(Err(err)) if role == Role::Client => ready.push(Readiness {
                id,
                role,
                event: Event::Error(err),
            }),
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Pending => {}
        }
    }

    if ready.is_empty() {
        Poll::Pending
    } else {
        Poll::Ready(Ok(ready))
    }
}
