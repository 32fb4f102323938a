//! On-disk trace catalog.
//!
//! A store is a flat directory of `*.trace` files. The recorder asks it
//! for a fresh file per accepted connection; readers only ever see
//! files that already exist under their final name, so there is no
//! mid-creation visibility window to guard against.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::trace::constants::TRACE_FILE_EXT;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid trace name {0:?}")]
    InvalidName(String),

    #[error("trace {0:?} not found")]
    NotFound(String),

    #[error("trace store i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// One catalog entry, as reported to control-plane peers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TraceEntry {
    pub name: String,
    pub size: u64,
    pub modified_ms: u64,
}

/// A freshly allocated trace, owned exclusively by its recorder relay
/// until the connection closes.
pub struct NewTrace {
    pub name: String,
    pub path: PathBuf,
    pub file: File,
}

/// Catalog of recorded traces in one directory.
pub struct TraceStore {
    dir: PathBuf,
}

// Collisions on the random suffix are vanishingly rare; bail out rather
// than loop forever if the directory is in a bad state.
const CREATE_ATTEMPTS: usize = 8;

impl TraceStore {
    /// Open (creating if needed) a store directory.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(TraceStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate a new trace file under a unique final name, opened for
    /// append. The file is visible in the catalog from this moment on.
    pub fn create_trace(&self) -> Result<NewTrace, StoreError> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut last_err = None;
        for _ in 0..CREATE_ATTEMPTS {
            let suffix: u32 = rand::rng().random();
            let name = format!("{millis}-{suffix:08x}.{TRACE_FILE_EXT}");
            let path = self.dir.join(&name);
            match OpenOptions::new().append(true).create_new(true).open(&path) {
                Ok(file) => {
                    info!("allocated trace {name}");
                    return Ok(NewTrace { name, path, file });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    last_err = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_err
            .map(StoreError::Io)
            .unwrap_or_else(|| StoreError::InvalidName("trace id space exhausted".into())))
    }

    /// All traces in the catalog, sorted by name (creation order, since
    /// names lead with a timestamp).
    pub fn list(&self) -> Result<Vec<TraceEntry>, StoreError> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(&format!(".{TRACE_FILE_EXT}")) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let modified_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            entries.push(TraceEntry {
                name: name.to_string(),
                size: meta.len(),
                modified_ms,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Resolve a catalog name to its on-disk path, refusing anything
    /// that is not a plain `*.trace` file name.
    pub fn open(&self, name: &str) -> Result<(PathBuf, TraceEntry), StoreError> {
        if name.contains(['/', '\\'])
            || name.contains("..")
            || !name.ends_with(&format!(".{TRACE_FILE_EXT}"))
        {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        let path = self.dir.join(name);
        let meta = std::fs::metadata(&path).map_err(|_| StoreError::NotFound(name.to_string()))?;
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok((
            path,
            TraceEntry {
                name: name.to_string(),
                size: meta.len(),
                modified_ms,
            },
        ))
    }
}
