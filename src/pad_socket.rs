//! Unix socket PAD publisher. Every connected client receives each update
//! as one JSON line; a client that connects late gets the latest update
//! first.
//!
//! Each client has a bounded queue. A client that falls that far behind, or
//! blocks a write for longer than [`WRITE_TIMEOUT`], is disconnected.

use crate::error::Result;
use crate::pad::PadSink;
use std::io::{self, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Updates buffered per client before it is dropped as stalled.
pub const CLIENT_QUEUE_DEPTH: usize = 64;
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type ClientList = Arc<Mutex<Vec<mpsc::SyncSender<String>>>>;

fn broadcast(clients: &ClientList, msg: &str) {
    let mut list = clients.lock().unwrap_or_else(|e| e.into_inner());
    list.retain(|tx| match tx.try_send(msg.to_string()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("PAD client stalled; dropping it");
            false
        }
        Err(TrySendError::Disconnected(_)) => false,
    });
}

pub struct UnixPadPublisher {
    path: PathBuf,
    clients: ClientList,
    last: Arc<Mutex<Option<String>>>,
}

impl UnixPadPublisher {
    /// Bind the socket (replacing a stale one) and start accepting clients.
    pub fn bind(path: &Path) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        info!("PAD socket listening on {}", path.display());

        let clients: ClientList = Arc::new(Mutex::new(Vec::new()));
        let last = Arc::new(Mutex::new(None));
        {
            let clients = Arc::clone(&clients);
            let last = Arc::clone(&last);
            thread::spawn(move || accept_loop(listener, clients, last));
        }
        Ok(UnixPadPublisher {
            path: path.to_path_buf(),
            clients,
            last,
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn accept_loop(listener: UnixListener, clients: ClientList, last: Arc<Mutex<Option<String>>>) {
    for stream in listener.incoming() {
        match stream {
            Ok(s) => {
                if let Err(e) = s.set_write_timeout(Some(WRITE_TIMEOUT)) {
                    warn!("PAD client rejected: {e}");
                    continue;
                }
                let (tx, rx) = mpsc::sync_channel::<String>(CLIENT_QUEUE_DEPTH);
                if let Some(msg) = last.lock().unwrap_or_else(|e| e.into_inner()).clone() {
                    tx.try_send(msg).ok();
                }
                clients.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
                thread::spawn(move || write_client(s, rx));
            }
            Err(e) => warn!("PAD socket accept error: {e}"),
        }
    }
}

fn write_client(stream: UnixStream, rx: mpsc::Receiver<String>) {
    let mut w = io::BufWriter::new(stream);
    for line in rx {
        if writeln!(w, "{line}").is_err() || w.flush().is_err() {
            debug!("PAD client went away");
            break;
        }
    }
}

impl PadSink for UnixPadPublisher {
    fn publish(&mut self, payload: &str) -> Result<()> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(payload.to_string());
        broadcast(&self.clients, payload);
        Ok(())
    }
}

impl Drop for UnixPadPublisher {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
