//! Network trace recorder.
//!
//! Accepts producer connections and durably captures each one to its own
//! trace file while the connection is live. Each connection gets one
//! relay: a strict read-then-write ping-pong between the socket and the
//! file through a single fixed buffer, so at most one read and one write
//! are ever outstanding per connection. Everything (accept loop, relays,
//! housekeeping) runs on the shared reactor; no per-connection thread is
//! spawned.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::store::TraceStore;
use crate::trace::constants::{RECORDER_TICK_MS, RELAY_BUFFER_SIZE};

/// Status of one live (or just-closed, not yet reaped) relay.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub trace: String,
    pub peer: String,
    pub bytes: u64,
    pub closed: bool,
}

/// Snapshot of the recorder for the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct RecorderStatus {
    pub active: usize,
    pub total_recorded: u64,
    pub relays: Vec<RelayStatus>,
}

// State shared between a relay task and status readers.
struct RelayState {
    trace: String,
    peer: SocketAddr,
    bytes: AtomicU64,
    closed: AtomicBool,
}

struct RelayEntry {
    state: Arc<RelayState>,
    // Held so housekeeping owns the task's lifetime; dropped on reap,
    // after the task has marked itself closed.
    _handle: JoinHandle<()>,
}

/// Accept loop plus per-connection relays over one trace store.
pub struct Recorder {
    store: Arc<TraceStore>,
    total_recorded: AtomicU64,
    relays: Mutex<Vec<RelayEntry>>,
}

impl Recorder {
    pub fn new(store: Arc<TraceStore>) -> Arc<Self> {
        Arc::new(Recorder {
            store,
            total_recorded: AtomicU64::new(0),
            relays: Mutex::new(Vec::new()),
        })
    }

    /// Run the accept loop until `shutdown` fires. Housekeeping reaps
    /// closed relays on a fixed tick.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("recorder listening on {}", listener.local_addr()?);
        let mut tick = interval(Duration::from_millis(RECORDER_TICK_MS));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => self.reap(),
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => self.track(socket, peer, shutdown.clone()),
                    Err(err) => warn!("accept failed: {err}"),
                },
            }
        }
        // Relays watch the same shutdown signal and tear down on their
        // own; one final reap clears whatever already finished.
        self.reap();
        Ok(())
    }

    /// Pair an accepted connection with a fresh trace file and start its
    /// relay. If the store cannot allocate a trace the connection is
    /// simply not tracked: the socket drops here and the recorder keeps
    /// accepting others.
    fn track(self: &Arc<Self>, socket: TcpStream, peer: SocketAddr, shutdown: watch::Receiver<bool>) {
        let trace = match self.store.create_trace() {
            Ok(trace) => trace,
            Err(err) => {
                warn!("not recording connection from {peer}: {err}");
                return;
            }
        };
        info!("recording {peer} into {}", trace.name);
        self.total_recorded.fetch_add(1, Ordering::Relaxed);

        let state = Arc::new(RelayState {
            trace: trace.name,
            peer,
            bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let handle = tokio::spawn(relay(socket, trace.file, Arc::clone(&state), shutdown));
        self.relays.lock().unwrap().push(RelayEntry {
            state,
            _handle: handle,
        });
    }

    /// Drop entries whose relay has closed. Runs on the recorder's own
    /// task; status readers only take the lock briefly to snapshot.
    fn reap(&self) {
        let mut relays = self.relays.lock().unwrap();
        let before = relays.len();
        relays.retain(|entry| !entry.state.closed.load(Ordering::Acquire));
        let reaped = before - relays.len();
        if reaped > 0 {
            debug!("reaped {reaped} closed relays");
        }
    }

    pub fn status(&self) -> RecorderStatus {
        let relays = self.relays.lock().unwrap();
        let statuses: Vec<RelayStatus> = relays
            .iter()
            .map(|entry| RelayStatus {
                trace: entry.state.trace.clone(),
                peer: entry.state.peer.to_string(),
                bytes: entry.state.bytes.load(Ordering::Relaxed),
                closed: entry.state.closed.load(Ordering::Acquire),
            })
            .collect();
        RecorderStatus {
            active: statuses.iter().filter(|s| !s.closed).count(),
            total_recorded: self.total_recorded.load(Ordering::Relaxed),
            relays: statuses,
        }
    }
}

/// One connection's socket-to-file copy.
///
/// Read and write strictly alternate through one buffer. Socket EOF,
/// socket error, file error, or shutdown all land in the same place:
/// both handles drop, the relay marks itself closed, and housekeeping
/// reaps it. Bytes read but not yet written when the relay is cancelled
/// are discarded; a trace may therefore end mid-packet, and readers
/// tolerate that.
async fn relay(
    mut socket: TcpStream,
    file: std::fs::File,
    state: Arc<RelayState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut file = tokio::fs::File::from_std(file);
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = shutdown.changed() => break,
            read = socket.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("{}: peer closed", state.trace);
                    break;
                }
                Ok(n) => n,
                Err(err) => {
                    debug!("{}: socket error: {err}", state.trace);
                    break;
                }
            },
        };
        let written = tokio::select! {
            _ = shutdown.changed() => break,
            write = file.write_all(&buf[..n]) => write,
        };
        if let Err(err) = written {
            warn!("{}: write failed, closing: {err}", state.trace);
            break;
        }
        state.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }
    let _ = file.flush().await;
    state.closed.store(true, Ordering::Release);
}
