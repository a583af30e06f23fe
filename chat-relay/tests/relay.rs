use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result, anyhow, ensure};
use chat_relay::{
    config::RelayConfig,
    monitor::{self, MonitorControl, MonitorExit, control_channel},
    relay::{Relay, RelayStatus},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(250);
const STREAM_WAIT: Duration = Duration::from_secs(30);
const STREAM_BLOCK: usize = 64 * 1024;
const STREAM_LIMIT: usize = 64 * 1024 * 1024;

struct Harness {
    addr: SocketAddr,
    monitor: MonitorControl,
    status: watch::Receiver<RelayStatus>,
    task: JoinHandle<Result<RelayStatus>>,
}

impl Harness {
    async fn start(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let (relay_control, monitor) = control_channel()?;
        let relay = Relay::new(listener, relay_control, &config)?;
        let addr = relay.local_addr();
        let status = relay.status();
        let task = tokio::spawn(relay.run());

        Ok(Self {
            addr,
            monitor,
            status,
            task,
        })
    }

    /// Connects one client and waits until the relay has registered it.
    async fn join(&mut self) -> Result<TcpStream> {
        self.join_with(TcpSocket::new_v4()?).await
    }

    async fn join_with(&mut self, socket: TcpSocket) -> Result<TcpStream> {
        let expected = self.status.borrow().clients + 1;
        let stream = socket.connect(self.addr).await?;
        self.wait_for(|status| status.clients == expected).await?;
        Ok(stream)
    }

    async fn join_many(&mut self, count: usize) -> Result<Vec<TcpStream>> {
        let mut clients = Vec::with_capacity(count);
        for _ in 0..count {
            clients.push(self.join().await?);
        }
        Ok(clients)
    }

    async fn wait_for<F>(&mut self, predicate: F) -> Result<RelayStatus>
    where
        F: FnMut(&RelayStatus) -> bool,
    {
        let status = timeout(WAIT, self.status.wait_for(predicate))
            .await
            .map_err(|_| anyhow!("timed out waiting for relay status"))??;
        Ok(*status)
    }
}

async fn expect_bytes<R>(reader: &mut R, expected: &[u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut received = vec![0u8; expected.len()];
    timeout(WAIT, reader.read_exact(&mut received))
        .await
        .map_err(|_| anyhow!("timed out waiting for {:?}", String::from_utf8_lossy(expected)))??;
    assert_eq!(received, expected);
    Ok(())
}

async fn expect_silence<R>(reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 64];
    match timeout(QUIET, reader.read(&mut buf)).await {
        Err(_) => Ok(()),
        Ok(Ok(n)) => Err(anyhow!(
            "expected silence, got {n} bytes: {:?}",
            String::from_utf8_lossy(&buf[..n])
        )),
        Ok(Err(err)) => Err(err.into()),
    }
}

async fn expect_eof<R>(reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 64];
    match timeout(WAIT, reader.read(&mut buf)).await {
        Ok(Ok(0)) => Ok(()),
        Ok(Ok(n)) => Err(anyhow!("expected eof, got {n} bytes")),
        Ok(Err(err)) if err.kind() == std::io::ErrorKind::ConnectionReset => Ok(()),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(anyhow!("timed out waiting for eof")),
    }
}

#[tokio::test]
async fn chunk_reaches_every_other_client() -> Result<()> {
    let mut relay = Harness::start(RelayConfig::default()).await?;
    let mut clients = relay.join_many(3).await?;

    clients[0].write_all(b"hello").await?;

    expect_bytes(&mut clients[1], b"hello").await?;
    expect_bytes(&mut clients[2], b"hello").await?;
    expect_bytes(&mut relay.monitor.from_relay, b"hello").await?;
    expect_silence(&mut clients[0]).await?;
    Ok(())
}

#[tokio::test]
async fn connection_beyond_capacity_is_closed() -> Result<()> {
    let config = RelayConfig::default();
    let mut relay = Harness::start(config.clone()).await?;
    let mut clients = relay.join_many(config.client_capacity()).await?;

    let mut extra = TcpStream::connect(relay.addr).await?;
    let status = relay.wait_for(|status| status.rejected == 1).await?;
    assert_eq!(status.clients, config.client_capacity());
    expect_eof(&mut extra).await?;

    clients[0].write_all(b"still here").await?;
    for client in clients.iter_mut().skip(1) {
        expect_bytes(client, b"still here").await?;
    }
    expect_silence(&mut clients[0]).await?;
    Ok(())
}

#[tokio::test]
async fn freed_slot_admits_new_client() -> Result<()> {
    let config = RelayConfig {
        max_endpoints: 4,
        ..RelayConfig::default()
    };
    let mut relay = Harness::start(config).await?;
    let mut clients = relay.join_many(2).await?;

    drop(clients.pop());
    relay.wait_for(|status| status.clients == 1).await?;

    let mut newcomer = relay.join().await?;
    clients[0].write_all(b"welcome").await?;
    expect_bytes(&mut newcomer, b"welcome").await?;
    assert_eq!(relay.status.borrow().rejected, 0);
    Ok(())
}

#[tokio::test]
async fn monitor_input_reaches_all_clients() -> Result<()> {
    let mut relay = Harness::start(RelayConfig::default()).await?;
    let mut clients = relay.join_many(3).await?;

    relay.monitor.to_relay.write_all(b"ping").await?;

    for client in &mut clients {
        expect_bytes(client, b"ping").await?;
    }
    expect_silence(&mut relay.monitor.from_relay).await?;
    Ok(())
}

#[tokio::test]
async fn disconnect_leaves_others_connected() -> Result<()> {
    let mut relay = Harness::start(RelayConfig::default()).await?;
    let mut clients = relay.join_many(3).await?;

    let leaving = clients.remove(1);
    drop(leaving);
    let status = relay
        .wait_for(|status| status.disconnected == 1 && status.clients == 2)
        .await?;
    assert_eq!(status.accepted, 3);

    clients[0].write_all(b"still there?").await?;
    expect_bytes(&mut clients[1], b"still there?").await?;

    clients[1].write_all(b"yes").await?;
    expect_bytes(&mut clients[0], b"yes").await?;
    Ok(())
}

#[tokio::test]
async fn reset_connection_only_drops_that_client() -> Result<()> {
    let mut relay = Harness::start(RelayConfig::default()).await?;
    let mut clients = relay.join_many(3).await?;

    let resetting = clients.remove(1);
    resetting.set_linger(Some(Duration::ZERO))?;
    drop(resetting);
    relay
        .wait_for(|status| status.disconnected == 1 && status.clients == 2)
        .await?;

    clients[0].write_all(b"after reset").await?;
    expect_bytes(&mut clients[1], b"after reset").await?;
    assert!(!relay.task.is_finished());
    Ok(())
}

/// Reads until the relay closes the stream, checking every byte against the
/// offset pattern written by the sender.
async fn drain_pattern(mut stream: TcpStream, received: watch::Sender<usize>) -> Result<usize> {
    let mut buf = vec![0u8; STREAM_BLOCK];
    let mut total = 0;
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => return Ok(total),
            Err(err) => return Err(err.into()),
        };
        for (offset, byte) in buf[..n].iter().enumerate() {
            ensure!(
                *byte == ((total + offset) % 256) as u8,
                "stream corrupted at byte {}",
                total + offset
            );
        }
        total += n;
        received.send_replace(total);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_reader_is_dropped_and_others_get_every_byte() -> Result<()> {
    let mut relay = Harness::start(RelayConfig::default()).await?;
    let mut sender = relay.join().await?;
    let reader = relay.join().await?;
    let stalled_socket = TcpSocket::new_v4()?;
    stalled_socket.set_recv_buffer_size(4096)?;
    let mut stalled = relay.join_with(stalled_socket).await?;

    let (received_tx, mut received) = watch::channel(0usize);
    let drain = tokio::spawn(drain_pattern(reader, received_tx));

    let block: Vec<u8> = (0..STREAM_BLOCK).map(|i| (i % 256) as u8).collect();
    let mut sent = 0;
    while relay.status.borrow().dropped == 0 {
        ensure!(sent < STREAM_LIMIT, "stalled client was never dropped");
        timeout(STREAM_WAIT, sender.write_all(&block))
            .await
            .context("relay stopped reading from the sender")??;
        sent += block.len();
    }

    let status = relay.wait_for(|status| status.disconnected == 1).await?;
    assert_eq!(status.dropped, 1);
    assert_eq!(status.clients, 2);

    timeout(STREAM_WAIT, received.wait_for(|&total| total == sent))
        .await
        .context("reader fell behind the sender")??;
    assert!(!drain.is_finished());

    // The dropped client sees whatever was queued, then the close.
    let mut sink = Vec::new();
    match timeout(WAIT, stalled.read_to_end(&mut sink)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) if err.kind() == std::io::ErrorKind::ConnectionReset => {}
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => return Err(anyhow!("dropped client was never closed")),
    }
    assert!(sink.len() < sent);

    assert!(!relay.task.is_finished());
    assert_eq!(relay.status.borrow().clients, 2);
    Ok(())
}

#[tokio::test]
async fn failed_write_during_broadcast_only_drops_that_peer() -> Result<()> {
    let mut relay = Harness::start(RelayConfig::default()).await?;
    let mut clients = relay.join_many(3).await?;

    // The reset and the earlier client's chunk both land before the relay's
    // next wait, so the broadcast reaches the dead peer before its read does.
    let resetting = clients.remove(2);
    resetting.set_linger(Some(Duration::ZERO))?;
    drop(resetting);
    clients[0].write_all(b"anyone left?").await?;

    expect_bytes(&mut clients[1], b"anyone left?").await?;
    let status = relay
        .wait_for(|status| status.disconnected == 1 && status.clients == 2)
        .await?;
    assert_eq!(status.accepted, 3);
    assert!(!relay.task.is_finished());

    clients[1].write_all(b"me").await?;
    expect_bytes(&mut clients[0], b"me").await?;
    expect_silence(&mut clients[1]).await?;
    Ok(())
}

#[tokio::test]
async fn monitor_hangup_stops_relay_and_closes_clients() -> Result<()> {
    let mut relay = Harness::start(RelayConfig::default()).await?;
    let mut clients = relay.join_many(2).await?;
    let Harness {
        addr,
        monitor,
        task,
        ..
    } = relay;
    let MonitorControl {
        to_relay,
        mut from_relay,
    } = monitor;

    drop(to_relay);

    let final_status = timeout(WAIT, task).await???;
    assert_eq!(final_status.clients, 0);
    assert_eq!(final_status.accepted, 2);
    for client in &mut clients {
        expect_eof(client).await?;
    }
    expect_eof(&mut from_relay).await?;
    assert!(TcpStream::connect(addr).await.is_err());
    Ok(())
}

#[tokio::test]
async fn operator_window_round_trip() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let (relay_control, monitor_control) = control_channel()?;
    let relay = Relay::new(listener, relay_control, &RelayConfig::default())?;
    let addr = relay.local_addr();
    let mut status = relay.status();
    let relay_task = tokio::spawn(relay.run());

    let (keyboard_tx, keyboard_rx) = mpsc::channel(4);
    let (display, mut screen) = tokio::io::duplex(1024);
    let monitor_task = tokio::spawn(monitor::run(monitor_control, keyboard_rx, display));

    let mut client = TcpStream::connect(addr).await?;
    timeout(WAIT, status.wait_for(|s| s.clients == 1)).await??;

    client.write_all(b"hi operator\n").await?;
    expect_bytes(&mut screen, b"hi operator\n").await?;

    keyboard_tx.send(b"hi client\n".to_vec()).await?;
    expect_bytes(&mut client, b"hi client\n").await?;

    drop(keyboard_tx);
    assert_eq!(
        timeout(WAIT, monitor_task).await???,
        MonitorExit::KeyboardClosed
    );
    let final_status = timeout(WAIT, relay_task).await???;
    assert!(final_status.relayed >= 2);
    expect_eof(&mut client).await?;
    Ok(())
}
