//! Non-blocking byte streams tracked by the relay.
//!
//! An [`Endpoint`] wraps one tokio handle (listener, client socket, or one
//! end of a control pipe). All I/O goes through `try_read`/`try_write`, so an
//! operation that cannot make progress reports [`ReadOutcome::WouldBlock`]
//! instead of suspending the relay loop.

use std::{
    fmt, io,
    net::SocketAddr,
    task::{Context, Poll},
};

use tokio::net::{
    TcpListener, TcpStream,
    unix::pipe::{Receiver, Sender},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    ControlIn,
    ControlOut,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    Eof,
    WouldBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(usize),
    WouldBlock,
}

/// Result of pushing a whole chunk without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Complete,
    /// The peer stopped accepting bytes after `written` of them.
    Partial { written: usize },
}

#[derive(Debug)]
enum Handle {
    Listener {
        listener: TcpListener,
        pending: Option<(TcpStream, SocketAddr)>,
    },
    ControlIn(Receiver),
    ControlOut(Sender),
    Client {
        stream: TcpStream,
        peer: SocketAddr,
    },
}

#[derive(Debug)]
pub struct Endpoint {
    role: Role,
    handle: Option<Handle>,
}

impl Endpoint {
    fn open(role: Role, handle: Handle) -> Self {
        Self {
            role,
            handle: Some(handle),
        }
    }

    pub fn listener(listener: TcpListener) -> Self {
        Self::open(
            Role::Listener,
            Handle::Listener {
                listener,
                pending: None,
            },
        )
    }

    pub fn control_in(receiver: Receiver) -> Self {
        Self::open(Role::ControlIn, Handle::ControlIn(receiver))
    }

    pub fn control_out(sender: Sender) -> Self {
        Self::open(Role::ControlOut, Handle::ControlOut(sender))
    }

    pub fn client(stream: TcpStream, peer: SocketAddr) -> Self {
        Self::open(Role::Client, Handle::Client { stream, peer })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Remote address for client endpoints.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.handle {
            Some(Handle::Client { peer, .. }) => Some(*peer),
            _ => None,
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let result = match self.handle.as_ref() {
            Some(Handle::Client { stream, .. }) => stream.try_read(buf),
            Some(Handle::ControlIn(receiver)) => receiver.try_read(buf),
            Some(_) => return Err(unsupported(self.role, "read")),
            None => return Err(closed(self.role)),
        };

        match result {
            Ok(0) if !buf.is_empty() => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(err) if retryable(&err) => Ok(ReadOutcome::WouldBlock),
            Err(err) => Err(err),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<WriteOutcome> {
        let result = match self.handle.as_ref() {
            Some(Handle::Client { stream, .. }) => stream.try_write(buf),
            Some(Handle::ControlOut(sender)) => sender.try_write(buf),
            Some(_) => return Err(unsupported(self.role, "write")),
            None => return Err(closed(self.role)),
        };

        match result {
            Ok(n) => Ok(WriteOutcome::Written(n)),
            Err(err) if retryable(&err) => Ok(WriteOutcome::WouldBlock),
            Err(err) => Err(err),
        }
    }

    /// Writes as much of `chunk` as the peer takes right now.
    pub fn deliver(&mut self, chunk: &[u8]) -> io::Result<Delivery> {
        let mut written = 0;
        while written < chunk.len() {
            match self.write(&chunk[written..])? {
                WriteOutcome::Written(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "peer accepted zero bytes",
                    ));
                }
                WriteOutcome::Written(n) => written += n,
                WriteOutcome::WouldBlock => return Ok(Delivery::Partial { written }),
            }
        }
        Ok(Delivery::Complete)
    }

    /// Polls read readiness.
    ///
    /// The listener is ready once a connection has been accepted and parked;
    /// collect it with [`take_pending`](Self::take_pending). Closed and
    /// write-only endpoints never become ready.
    pub fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.handle.as_mut() {
            Some(Handle::Listener { listener, pending }) => {
                if pending.is_some() {
                    return Poll::Ready(Ok(()));
                }
                match listener.poll_accept(cx) {
                    Poll::Ready(Ok(accepted)) => {
                        *pending = Some(accepted);
                        Poll::Ready(Ok(()))
                    }
                    Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
                    Poll::Pending => Poll::Pending,
                }
            }
            Some(Handle::Client { stream, .. }) => stream.poll_read_ready(cx),
            Some(Handle::ControlIn(receiver)) => receiver.poll_read_ready(cx),
            Some(Handle::ControlOut(_)) | None => Poll::Pending,
        }
    }

    /// Hands over the connection parked by [`poll_ready`](Self::poll_ready).
    pub fn take_pending(&mut self) -> Option<(TcpStream, SocketAddr)> {
        match self.handle.as_mut() {
            Some(Handle::Listener { pending, .. }) => pending.take(),
            _ => None,
        }
    }

    /// Releases the OS handle. Returns `false` if it was already released.
    pub fn close(&mut self) -> bool {
        self.handle.take().is_some()
    }
}

fn retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn unsupported(role: Role, op: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{op} is not supported on a {role:?} endpoint"),
    )
}

fn closed(role: Role) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        format!("{role:?} endpoint is closed"),
    )
}
