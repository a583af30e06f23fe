//! The operator's chat window and its pipe pair to the relay.
//!
//! The relay sees the monitor as a pseudo-client: chunks typed by the
//! operator arrive on the control pipe and are broadcast to every client,
//! while every client chunk is mirrored back down a second pipe for display.
//! Closing the operator's input closes the control pipe, which the relay
//! treats as a request to shut down.

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::unix::pipe,
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    config::CHUNK_SIZE,
    endpoint::{Delivery, Endpoint},
};

/// Relay-side ends of the control channel.
#[derive(Debug)]
pub struct RelayControl {
    pub inbound: pipe::Receiver,
    pub outbound: pipe::Sender,
}

/// Monitor-side ends of the control channel.
#[derive(Debug)]
pub struct MonitorControl {
    pub to_relay: pipe::Sender,
    pub from_relay: pipe::Receiver,
}

/// Builds both pipes of the control channel.
pub fn control_channel() -> std::io::Result<(RelayControl, MonitorControl)> {
    let (to_relay, inbound) = pipe::pipe()?;
    let (outbound, from_relay) = pipe::pipe()?;
    Ok((
        RelayControl { inbound, outbound },
        MonitorControl {
            to_relay,
            from_relay,
        },
    ))
}

/// Relay-side writer that copies client traffic to the monitor.
#[derive(Debug)]
pub struct MonitorBridge {
    outbound: Endpoint,
}

impl MonitorBridge {
    pub fn new(outbound: Endpoint) -> Self {
        Self { outbound }
    }

    pub fn is_open(&self) -> bool {
        self.outbound.is_open()
    }

    /// Best-effort copy of `chunk` to the monitor display.
    ///
    /// A monitor that stops reading loses the chunk; one that has gone away
    /// switches mirroring off for good.
    pub fn mirror(&mut self, chunk: &[u8]) {
        if !self.outbound.is_open() {
            return;
        }
        match self.outbound.deliver(chunk) {
            Ok(Delivery::Complete) => {}
            Ok(Delivery::Partial { written }) => {
                debug!(written, len = chunk.len(), "monitor lagging; chunk truncated");
            }
            Err(err) => {
                warn!(error = %err, "monitor pipe failed; mirroring disabled");
                self.outbound.close();
            }
        }
    }

    pub fn close(&mut self) {
        self.outbound.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Operator input ended; the relay has been asked to stop.
    KeyboardClosed,
    /// The relay closed its side of the channel.
    RelayClosed,
}

/// Runs the monitor until either side of the conversation ends.
///
/// `keyboard` carries operator input (see
/// [`spawn_stdin_reader`](crate::console::spawn_stdin_reader)); `display`
/// receives every chunk the relay mirrors.
pub async fn run<W>(
    control: MonitorControl,
    mut keyboard: mpsc::Receiver<Vec<u8>>,
    mut display: W,
) -> Result<MonitorExit>
where
    W: AsyncWrite + Unpin,
{
    let MonitorControl {
        mut to_relay,
        mut from_relay,
    } = control;
    let mut buf = [0u8; CHUNK_SIZE];

    let exit = loop {
        select! {
            input = keyboard.recv() => {
                let Some(chunk) = input else {
                    break MonitorExit::KeyboardClosed;
                };
                to_relay
                    .write_all(&chunk)
                    .await
                    .context("failed to forward operator input to relay")?;
            }
            read = from_relay.read(&mut buf) => {
                let n = read.context("failed to read from relay")?;
                if n == 0 {
                    break MonitorExit::RelayClosed;
                }
                display.write_all(&buf[..n]).await?;
                display.flush().await?;
            }
        }
    };

    info!(?exit, "monitor closing");
    Ok(exit)
}
