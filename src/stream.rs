//! Byte sources feeding the packet transport.
//!
//! A reader's contract is deliberately loose: `read` may return fewer
//! bytes than asked for, and returns 0 only once the source is confirmed
//! exhausted. The file-backed reader tolerates a producer that is still
//! appending (a live trace being recorded) by polling for growth rather
//! than treating the current end of file as the end of the stream.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

/// An ordered byte source with monotonic read position.
pub trait StreamReader: Send {
    /// Read up to `buf.len()` bytes, returning how many were read.
    /// A return of 0 means the source is exhausted and closed; transient
    /// shortfalls are absorbed internally.
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// How a [`FileStreamReader`] waits for a concurrent writer.
#[derive(Clone, Copy, Debug)]
pub struct FollowPolicy {
    /// Sleep between size re-polls when no bytes are available.
    pub poll_interval: Duration,

    /// Give up and report exhaustion after this long without growth.
    pub idle_timeout: Duration,
}

impl Default for FollowPolicy {
    fn default() -> Self {
        FollowPolicy {
            poll_interval: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(1),
        }
    }
}

impl FollowPolicy {
    /// Do not wait for growth at all; useful for known-complete traces.
    pub fn no_follow() -> Self {
        FollowPolicy {
            poll_interval: Duration::from_millis(0),
            idle_timeout: Duration::from_millis(0),
        }
    }
}

/// Tail-following reader over a trace file that may still be written.
///
/// If the file cannot be opened at construction the reader is unusable
/// and every read returns 0; callers treat that as an empty stream, not
/// a hard error.
pub struct FileStreamReader {
    path: PathBuf,
    file: Option<File>,
    pos: u64,
    policy: FollowPolicy,
}

impl FileStreamReader {
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self::with_policy(path, FollowPolicy::default())
    }

    pub fn with_policy(path: impl AsRef<Path>, policy: FollowPolicy) -> Self {
        let path = path.as_ref().to_path_buf();
        let file = match File::open(&path) {
            Ok(f) => Some(f),
            Err(err) => {
                warn!("failed to open trace stream {}: {err}", path.display());
                None
            }
        };
        FileStreamReader {
            path,
            file,
            pos: 0,
            policy,
        }
    }

    /// Re-open the file and seek back to the current offset. The handle
    /// is refreshed whenever the on-disk size grows past what we have
    /// served, so a writer replacing or extending the file is picked up.
    fn reopen(&mut self) -> bool {
        match File::open(&self.path) {
            Ok(mut f) => {
                if f.seek(SeekFrom::Start(self.pos)).is_err() {
                    self.file = None;
                    return false;
                }
                self.file = Some(f);
                true
            }
            Err(err) => {
                debug!("reopen of {} failed: {err}", self.path.display());
                self.file = None;
                false
            }
        }
    }

    fn apparent_size(&self) -> Option<u64> {
        std::fs::metadata(&self.path).map(|m| m.len()).ok()
    }
}

impl StreamReader for FileStreamReader {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let mut waited = Duration::ZERO;
        loop {
            let Some(file) = self.file.as_mut() else {
                return 0;
            };
            match file.read(buf) {
                Ok(0) => {}
                Ok(n) => {
                    self.pos += n as u64;
                    return n;
                }
                Err(err) => {
                    warn!("read error on {}: {err}", self.path.display());
                    self.file = None;
                    return 0;
                }
            }

            // At the current end of file. Wait a bounded amount for the
            // producer to append more, re-polling the apparent size.
            if waited >= self.policy.idle_timeout {
                return 0;
            }
            std::thread::sleep(self.policy.poll_interval);
            waited += self.policy.poll_interval.max(Duration::from_millis(1));

            if let Some(size) = self.apparent_size() {
                if size > self.pos {
                    if !self.reopen() {
                        return 0;
                    }
                    waited = Duration::ZERO;
                }
            }
        }
    }
}

/// In-memory source with an optional per-call chunk cap, used to drive
/// the transport with arbitrary read-boundary splits.
pub struct BufferReader {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl BufferReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_chunk(data, usize::MAX)
    }

    /// Serve at most `chunk` bytes per read call.
    pub fn with_chunk(data: Vec<u8>, chunk: usize) -> Self {
        BufferReader {
            data,
            pos: 0,
            chunk: chunk.max(1),
        }
    }
}

impl StreamReader for BufferReader {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let remaining = self.data.len() - self.pos;
        let n = remaining.min(buf.len()).min(self.chunk);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_buffer_reader_chunks() {
        let mut reader = BufferReader::with_chunk(vec![1, 2, 3, 4, 5], 2);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf), 2);
        assert_eq!(reader.read(&mut buf), 2);
        assert_eq!(reader.read(&mut buf), 1);
        assert_eq!(reader.read(&mut buf), 0);
    }

    #[test]
    fn test_missing_file_reads_zero() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut reader = FileStreamReader::open(dir.path().join("nope.trace"));
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf), 0);
    }

    #[test]
    fn test_follows_concurrent_writer() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("live.trace");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"first").unwrap();
        f.sync_all().unwrap();

        let policy = FollowPolicy {
            poll_interval: Duration::from_millis(5),
            idle_timeout: Duration::from_millis(200),
        };
        let mut reader = FileStreamReader::with_policy(&path, policy);

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            f.write_all(b"second").unwrap();
            f.sync_all().unwrap();
        });

        let mut collected = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = reader.read(&mut buf);
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        writer.join().unwrap();
        assert_eq!(collected, b"firstsecond");
    }

    #[test]
    fn test_idle_timeout_terminates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("done.trace");
        std::fs::write(&path, b"all").unwrap();

        let policy = FollowPolicy {
            poll_interval: Duration::from_millis(5),
            idle_timeout: Duration::from_millis(20),
        };
        let mut reader = FileStreamReader::with_policy(&path, policy);
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf), 3);
        assert_eq!(reader.read(&mut buf), 0);
    }
}
