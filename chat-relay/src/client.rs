use anyhow::{Context, Result};
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    cli::{ClientArgs, resolve_ipv4},
    config::CHUNK_SIZE,
    console::spawn_stdin_reader,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Local input reached EOF.
    InputClosed,
    /// The relay closed the connection.
    RelayClosed,
    Interrupted,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let addr = resolve_ipv4(&args.host, args.port).await?;
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    info!("connected to {addr}");

    let end = run_session(stream, spawn_stdin_reader(), tokio::io::stdout()).await?;
    info!(?end, "session ended");
    Ok(())
}

/// Shuttles chunks between the relay and the terminal until one side ends.
pub async fn run_session<W>(
    mut stream: TcpStream,
    mut keyboard: mpsc::Receiver<Vec<u8>>,
    mut display: W,
) -> Result<SessionEnd>
where
    W: AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = stream.split();
    let mut buf = [0u8; CHUNK_SIZE];

    let end = loop {
        select! {
            input = keyboard.recv() => {
                let Some(chunk) = input else {
                    break SessionEnd::InputClosed;
                };
                writer
                    .write_all(&chunk)
                    .await
                    .context("failed to send to relay")?;
            }
            read = reader.read(&mut buf) => {
                let n = read.context("failed to read from relay")?;
                if n == 0 {
                    break SessionEnd::RelayClosed;
                }
                display.write_all(&buf[..n]).await?;
                display.flush().await?;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break SessionEnd::Interrupted;
            }
        }
    };

    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shut down connection cleanly");
    }
    Ok(end)
}
