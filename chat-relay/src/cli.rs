use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::lookup_host;

use crate::config::{DEFAULT_PORT, MAX_CLIENTS, POLL_INTERVAL, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay; stdin and stdout become the operator's chat window.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address to bind. Defaults to every local IPv4 interface.
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    pub host: String,

    /// TCP port to listen on. Use 0 for an ephemeral port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Registry slots, including the two taken by the monitor and the listener.
    #[arg(long, default_value_t = MAX_CLIENTS)]
    pub max_clients: usize,

    /// Upper bound on one readiness wait, in milliseconds.
    #[arg(long, default_value_t = POLL_INTERVAL.as_millis() as u64)]
    pub poll_interval_ms: u64,
}

impl ServerArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_endpoints: self.max_clients,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..RelayConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host name or address of the relay.
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// TCP port of the relay.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

/// Resolves `host:port` to its first IPv4 address.
pub async fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {host}:{port}"))?;
    addrs
        .find(SocketAddr::is_ipv4)
        .with_context(|| format!("{host}:{port} has no IPv4 address"))
}
