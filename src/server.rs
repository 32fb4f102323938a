//! Control-plane server.
//!
//! Composes the trace store and the recorder and exposes both to
//! external peers over TCP. The peer protocol is newline-delimited
//! JSON: one request object per line, one response object per line.
//! A malformed request gets an in-band error and the connection stays
//! up. Store and recorder accessors are plain `Arc` clones, safe from
//! any peer task while recording is ongoing.

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::recorder::Recorder;
use crate::store::TraceStore;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Request {
    /// Enumerate the trace catalog.
    List,
    /// Recording status: live relays, totals.
    Status,
    /// Resolve one catalog entry for reading.
    Open { name: String },
}

/// The store/recorder pair behind the control plane.
pub struct StoreService {
    store: Arc<TraceStore>,
    recorder: Arc<Recorder>,
}

impl StoreService {
    pub fn new(store: Arc<TraceStore>, recorder: Arc<Recorder>) -> Arc<Self> {
        Arc::new(StoreService { store, recorder })
    }

    pub fn store(&self) -> &Arc<TraceStore> {
        &self.store
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    /// Accept control-plane peers until `shutdown` fires; one task per
    /// peer on the shared reactor.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("control plane listening on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!("control peer connected: {peer}");
                        tokio::spawn(Arc::clone(&self).serve_peer(socket, shutdown.clone()));
                    }
                    Err(err) => warn!("control accept failed: {err}"),
                },
            }
        }
        Ok(())
    }

    async fn serve_peer(self: Arc<Self>, socket: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let (read_half, mut write_half) = socket.into_split();
        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.changed() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => break,
                },
            };
            if line.trim().is_empty() {
                continue;
            }
            let response = self.dispatch(&line);
            let mut payload = response.to_string();
            payload.push('\n');
            if write_half.write_all(payload.as_bytes()).await.is_err() {
                break;
            }
        }
        debug!("control peer disconnected");
    }

    /// Resolve one request line against the store and recorder.
    fn dispatch(&self, line: &str) -> serde_json::Value {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => return json!({ "ok": false, "error": format!("bad request: {err}") }),
        };
        match request {
            Request::List => match self.store.list() {
                Ok(traces) => json!({ "ok": true, "traces": traces }),
                Err(err) => json!({ "ok": false, "error": err.to_string() }),
            },
            Request::Status => {
                json!({ "ok": true, "recorder": self.recorder.status() })
            }
            Request::Open { name } => match self.store.open(&name) {
                Ok((path, entry)) => json!({
                    "ok": true,
                    "trace": entry,
                    "path": path.to_string_lossy(),
                }),
                Err(err) => json!({ "ok": false, "error": err.to_string() }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_handles_malformed_requests_in_band() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(TraceStore::new(dir.path()).unwrap());
        let recorder = Recorder::new(Arc::clone(&store));
        let service = StoreService::new(store, recorder);

        let response = service.dispatch("this is not json");
        assert_eq!(response["ok"], false);

        let response = service.dispatch(r#"{"cmd":"frobnicate"}"#);
        assert_eq!(response["ok"], false);
    }

    #[test]
    fn test_dispatch_list_and_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(TraceStore::new(dir.path()).unwrap());
        let name = store.create_trace().unwrap().name;
        let recorder = Recorder::new(Arc::clone(&store));
        let service = StoreService::new(store, recorder);

        let response = service.dispatch(r#"{"cmd":"list"}"#);
        assert_eq!(response["ok"], true);
        assert_eq!(response["traces"][0]["name"], name.as_str());

        let open = format!(r#"{{"cmd":"open","name":"{name}"}}"#);
        let response = service.dispatch(&open);
        assert_eq!(response["ok"], true);
        assert_eq!(response["trace"]["size"], 0);

        let response = service.dispatch(r#"{"cmd":"open","name":"../sneaky.trace"}"#);
        assert_eq!(response["ok"], false);
    }
}
