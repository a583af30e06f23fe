use std::{
    io::{self, Read},
    thread,
};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{CHUNK_SIZE, KEYBOARD_QUEUE};

/// Forwards stdin to the runtime in chunks of at most [`CHUNK_SIZE`] bytes.
///
/// Reading happens on a dedicated thread so a pending read never holds up
/// runtime shutdown. The channel closes on EOF, on a read error, or once
/// the receiver is dropped.
pub fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(KEYBOARD_QUEUE);
    thread::spawn(move || forward(io::stdin().lock(), tx));
    rx
}

fn forward<R: Read>(mut input: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match input.read(&mut buf) {
            Ok(0) => {
                debug!("stdin reached eof");
                break;
            }
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(error = %err, "stdin read failed");
                break;
            }
        }
    }
}
