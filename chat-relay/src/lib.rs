//! Chat relay with a local operator window.
//!
//! Remote clients connect over TCP and every chunk one of them sends is
//! copied to all the others. The process also runs a monitor: the operator's
//! own chat window, wired to the relay through a pair of pipes. Operator input
//! is broadcast to every client, and every client chunk is shown to the
//! operator. Closing the operator's input shuts the relay down.
//!
//! - [`relay`] owns the single-threaded readiness loop and the broadcast rules.
//! - [`registry`] keeps the bounded, ordered set of live endpoints.
//! - [`multiplexer`] waits for any registered endpoint to become readable.
//! - [`endpoint`] wraps sockets and pipe ends behind non-blocking reads and
//!   writes.
//! - [`monitor`] builds the control pipes, mirrors client traffic to the
//!   operator, and runs the operator's window.
//! - [`client`] is the terminal client.
//! - [`console`] feeds stdin to the runtime from a dedicated thread.
//! - [`cli`] and [`config`] hold the command line and its defaults.
//!
//! Payloads are opaque: a chunk is whatever one read returned, up to
//! [`config::CHUNK_SIZE`] bytes.

pub mod cli;
pub mod client;
pub mod config;
pub mod console;
pub mod endpoint;
pub mod monitor;
pub mod multiplexer;
pub mod registry;
pub mod relay;
