//! Relay tuning knobs and the constants they default to.

use std::time::Duration;

use anyhow::{Result, ensure};

/// TCP port the relay listens on (and the client dials) when none is given.
pub const DEFAULT_PORT: u16 = 3724;

/// Total number of registry slots, including the two reserved ones.
pub const MAX_CLIENTS: usize = 10;

/// Slots occupied by the control channel's read end and the listener.
pub const RESERVED_SLOTS: usize = 2;

/// Largest chunk moved by a single read.
pub const CHUNK_SIZE: usize = 1024;

/// Upper bound on one readiness wait.
///
/// Only needs to be bounded and non-zero; the relay does no timer work, so
/// the value just caps how long a shutdown request can go unnoticed.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Listen backlog handed to the kernel.
pub const LISTEN_BACKLOG: u32 = 10;

/// Keyboard chunks buffered between the stdin thread and its consumer.
pub const KEYBOARD_QUEUE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Registry capacity, counting the control channel and the listener.
    pub max_endpoints: usize,
    /// Timeout for each readiness wait.
    pub poll_interval: Duration,
    /// Listen backlog for [`Relay::bind`](crate::relay::Relay::bind).
    pub backlog: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_endpoints: MAX_CLIENTS,
            poll_interval: POLL_INTERVAL,
            backlog: LISTEN_BACKLOG,
        }
    }
}

impl RelayConfig {
    /// Number of chat clients this configuration admits at once.
    pub fn client_capacity(&self) -> usize {
        self.max_endpoints.saturating_sub(RESERVED_SLOTS)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_endpoints > RESERVED_SLOTS,
            "max endpoints must exceed the {RESERVED_SLOTS} reserved slots (got {})",
            self.max_endpoints
        );
        ensure!(
            !self.poll_interval.is_zero(),
            "poll interval must be non-zero"
        );
        Ok(())
    }
}
