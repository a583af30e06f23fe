use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::timeout;
use tracing::{info, warn};

use chat_relay::{
    cli::{self, Cli, Command, ServerArgs},
    client, console, monitor,
    relay::Relay,
};

const MONITOR_GRACE: Duration = Duration::from_secs(1);

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => serve(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn serve(args: ServerArgs) -> Result<()> {
    let addr = cli::resolve_ipv4(&args.host, args.port).await?;
    let (relay_control, monitor_control) =
        monitor::control_channel().context("failed to create control pipes")?;

    let relay = Relay::bind(addr, relay_control, args.relay_config()).await?;
    info!("relay listening on {}", relay.local_addr());

    let monitor = tokio::spawn(monitor::run(
        monitor_control,
        console::spawn_stdin_reader(),
        tokio::io::stdout(),
    ));

    let result = relay
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await;

    // The relay has dropped its pipe ends, so the monitor sees EOF and returns.
    match timeout(MONITOR_GRACE, monitor).await {
        Ok(Ok(Err(err))) => warn!(error = ?err, "monitor exited with error"),
        Ok(Err(err)) => warn!(error = ?err, "monitor task failed"),
        Err(_) => warn!("monitor did not stop in time"),
        Ok(Ok(Ok(_))) => {}
    }

    if let Err(err) = result {
        warn!("relay exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
