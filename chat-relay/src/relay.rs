//! The relay loop.
//!
//! One task owns the registry and walks it once per readiness wait:
//!
//! 1. admit at most one pending connection (closing it at once when the
//!    registry is full),
//! 2. read one chunk from the monitor and broadcast it to every client,
//! 3. read one chunk from each readable client, mirror it to the monitor and
//!    broadcast it to every other client,
//! 4. drop the clients that hung up or failed during the pass.
//!
//! Removals are deferred until the pass is over, and broadcasts skip clients
//! already scheduled for removal. A client that cannot take a whole chunk is
//! dropped rather than handed a truncated one. A misbehaving client only ever costs its
//! own connection; listener, multiplexer and control-channel failures end
//! the loop with an error.

use std::{
    future::{Future, pending},
    net::SocketAddr,
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpSocket},
    select,
    sync::watch,
};
use tracing::{debug, info, warn};

use crate::{
    config::{CHUNK_SIZE, RelayConfig},
    endpoint::{Delivery, Endpoint, EndpointId, ReadOutcome, Role},
    monitor::{MonitorBridge, RelayControl},
    multiplexer::{Event, Multiplexer},
    registry::{Registry, RegistryError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Running,
    /// The monitor hung up; the current pass finishes, then the loop stops.
    Draining,
    Stopped,
}

/// Counters published after every pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatus {
    /// Clients currently registered.
    pub clients: usize,
    pub accepted: u64,
    /// Connections closed on arrival because the registry was full.
    pub rejected: u64,
    pub disconnected: u64,
    /// Chunks read from clients or the monitor and fanned out.
    pub relayed: u64,
    /// Clients dropped because they stopped reading mid-chunk. These are
    /// also counted in `disconnected`.
    pub dropped: u64,
}

/// Where a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Monitor,
    Client(EndpointId),
}

#[derive(Debug)]
pub struct Chunk<'a> {
    pub origin: Origin,
    pub bytes: &'a [u8],
}

/// What one readiness wait turned up, split by role.
#[derive(Debug, Default)]
struct Pass {
    accept: bool,
    control: bool,
    clients: Vec<EndpointId>,
}

pub struct Relay {
    registry: Registry,
    monitor: MonitorBridge,
    mux: Multiplexer,
    local_addr: SocketAddr,
    state: RelayState,
    status: RelayStatus,
    status_tx: watch::Sender<RelayStatus>,
}

impl Relay {
    /// Binds an IPv4 or IPv6 listener with `SO_REUSEADDR` and wraps it.
    pub async fn bind(addr: SocketAddr, control: RelayControl, config: RelayConfig) -> Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("failed to create listening socket")?;
        socket
            .set_reuseaddr(true)
            .context("failed to set SO_REUSEADDR")?;
        socket
            .bind(addr)
            .with_context(|| format!("failed to bind {addr}"))?;
        let listener = socket
            .listen(config.backlog)
            .with_context(|| format!("failed to listen on {addr}"))?;

        Self::new(listener, control, &config)
    }

    pub fn new(listener: TcpListener, control: RelayControl, config: &RelayConfig) -> Result<Self> {
        config.validate()?;
        let local_addr = listener
            .local_addr()
            .context("listener has no local address")?;
        let registry = Registry::new(
            Endpoint::control_in(control.inbound),
            Endpoint::listener(listener),
            config.max_endpoints,
        )?;
        let (status_tx, _) = watch::channel(RelayStatus::default());

        Ok(Self {
            registry,
            monitor: MonitorBridge::new(Endpoint::control_out(control.outbound)),
            mux: Multiplexer::new(config.poll_interval),
            local_addr,
            state: RelayState::Running,
            status: RelayStatus::default(),
            status_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribes to the counters published after every pass.
    pub fn status(&self) -> watch::Receiver<RelayStatus> {
        self.status_tx.subscribe()
    }

    /// Relays until the monitor closes the control channel.
    pub async fn run(self) -> Result<RelayStatus> {
        self.run_until(pending()).await
    }

    /// Relays until the monitor hangs up or `shutdown` completes.
    ///
    /// Either way every client is closed before the listener, and the final
    /// counters are returned.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<RelayStatus>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        while self.state != RelayState::Stopped {
            // A pass only suspends inside the readiness wait, before it
            // touches any endpoint, so dropping it here loses nothing.
            select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    self.state = RelayState::Stopped;
                }
                result = self.pass() => result?,
            }
        }

        self.shutdown();
        Ok(self.status)
    }

    async fn pass(&mut self) -> Result<()> {
        let ready = self
            .mux
            .poll(&mut self.registry)
            .await
            .context("readiness wait failed")?;

        let mut pass = Pass::default();
        let mut departed = Vec::new();
        for readiness in ready {
            match (readiness.role, readiness.event) {
                (Role::Listener, _) => pass.accept = true,
                (Role::ControlIn, _) => pass.control = true,
                (Role::Client, Event::Readable) => pass.clients.push(readiness.id),
                (Role::Client, Event::Error(err)) => {
                    warn!(client = %readiness.id, error = %err, "client failed; dropping");
                    departed.push(readiness.id);
                }
                (Role::ControlOut, _) => {}
            }
        }

        if pass.accept {
            self.admit();
        }
        if pass.control {
            self.service_monitor(&mut departed)?;
        }
        for id in pass.clients {
            if !departed.contains(&id) {
                self.service_client(id, &mut departed);
            }
        }

        for id in departed {
            if self.registry.remove(id) {
                self.status.disconnected += 1;
            }
        }

        if self.state == RelayState::Draining {
            self.state = RelayState::Stopped;
        }
        self.publish();
        Ok(())
    }

    fn admit(&mut self) {
        let Some((stream, peer)) = self.registry.listener_mut().take_pending() else {
            return;
        };

        match self.registry.try_add(Endpoint::client(stream, peer)) {
            Ok(id) => {
                self.status.accepted += 1;
                info!(%peer, client = %id, "client connected");
            }
            Err(RegistryError::Full {
                capacity,
                mut rejected,
            }) => {
                rejected.close();
                self.status.rejected += 1;
                warn!(%peer, capacity, "registry full; connection closed");
            }
            Err(err) => warn!(%peer, error = %err, "connection not admitted"),
        }
    }

    fn service_monitor(&mut self, departed: &mut Vec<EndpointId>) -> Result<()> {
        let mut buf = [0u8; CHUNK_SIZE];
        let outcome = self
            .registry
            .control_in_mut()
            .read(&mut buf)
            .context("failed to read from monitor")?;

        match outcome {
            ReadOutcome::Eof => {
                info!("monitor closed the control channel; draining");
                self.state = RelayState::Draining;
            }
            ReadOutcome::WouldBlock => {}
            ReadOutcome::Data(n) => {
                debug!(len = n, "chunk from monitor");
                self.status.relayed += 1;
                self.broadcast(
                    &Chunk {
                        origin: Origin::Monitor,
                        bytes: &buf[..n],
                    },
                    departed,
                );
            }
        }
        Ok(())
    }

    fn service_client(&mut self, id: EndpointId, departed: &mut Vec<EndpointId>) {
        let Some(endpoint) = self.registry.get_mut(id) else {
            return;
        };
        let peer = endpoint.peer_addr();
        let mut buf = [0u8; CHUNK_SIZE];

        match endpoint.read(&mut buf) {
            Ok(ReadOutcome::Eof) => {
                info!(?peer, client = %id, "client disconnected");
                departed.push(id);
            }
            Ok(ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::Data(n)) => {
                debug!(?peer, client = %id, len = n, "chunk from client");
                self.status.relayed += 1;
                let chunk = Chunk {
                    origin: Origin::Client(id),
                    bytes: &buf[..n],
                };
                self.monitor.mirror(chunk.bytes);
                self.broadcast(&chunk, departed);
            }
            Err(err) => {
                warn!(?peer, client = %id, error = %err, "client read failed; dropping");
                departed.push(id);
            }
        }
    }

    /// Sends `chunk` to every client except its origin and the departed.
    fn broadcast(&mut self, chunk: &Chunk<'_>, departed: &mut Vec<EndpointId>) {
        let mut failed = Vec::new();
        let mut dropped = 0;

        self.registry.for_each_client(|id, endpoint| {
            if chunk.origin == Origin::Client(id) || departed.contains(&id) {
                return;
            }
            match endpoint.deliver(chunk.bytes) {
                Ok(Delivery::Complete) => {}
                // The rest of the chunk cannot be queued, so the peer's
                // stream would no longer match what was sent.
                Ok(Delivery::Partial { written }) => {
                    dropped += 1;
                    warn!(
                        client = %id,
                        written,
                        len = chunk.bytes.len(),
                        "client not reading; dropping"
                    );
                    failed.push(id);
                }
                Err(err) => {
                    warn!(client = %id, error = %err, "write to client failed; dropping");
                    failed.push(id);
                }
            }
        });

        self.status.dropped += dropped;
        departed.extend(failed);
    }

    fn publish(&mut self) {
        self.status.clients = self.registry.client_count();
        let status = self.status;
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn shutdown(&mut self) {
        self.registry.close_all();
        self.monitor.close();
        self.state = RelayState::Stopped;
        self.publish();
        info!(status = ?self.status, "relay stopped");
    }
}
