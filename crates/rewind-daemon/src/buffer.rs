//! Reading from a buffer file that is still being written.
//!
//! The recorder and the consumer share nothing but the file and the
//! `Frontier` counter.  A read below the frontier returns data immediately;
//! a read at the frontier polls until new data arrives or the bounded
//! timeout elapses, in which case it returns zero bytes — "no data yet,
//! try again", never end-of-stream.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use rewind_proto::config::BufferConfig;

/// Shared view of the producer's write frontier: total bytes durably
/// written, the upper bound for valid reads.  Monotonically non-decreasing.
#[derive(Clone, Debug, Default)]
pub struct Frontier(Arc<AtomicU64>);

impl Frontier {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Publishes a new total.  Callers must only advance after the bytes
    /// behind the new frontier are flushed to the file.
    pub fn advance_to(&self, total: u64) {
        debug_assert!(total >= self.get());
        self.0.store(total, Ordering::Release);
    }
}

pub struct LiveBufferSource {
    file: Option<File>,
    position: u64,
    frontier: Frontier,
    poll_interval: Duration,
    block_timeout: Duration,
}

impl LiveBufferSource {
    /// Opens the buffer file and positions the cursor at `offset`.  The
    /// file must already exist; the total length is unknown (live).
    /// Opening beyond the frontier is allowed — the first read then waits.
    pub fn open(
        path: &Path,
        offset: u64,
        frontier: Frontier,
        config: &BufferConfig,
    ) -> std::io::Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            file: Some(file),
            position: offset,
            frontier,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            block_timeout: Duration::from_millis(config.block_timeout_ms),
        })
    }

    /// Current read cursor, in bytes from the start of the buffer.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn frontier(&self) -> u64 {
        self.frontier.get()
    }

    /// Reads up to `buf.len()` bytes without crossing the frontier.
    ///
    /// Returns `Ok(0)` in exactly two cases: an empty `buf`, or the cursor
    /// caught up to the writer and no new data arrived within the block
    /// timeout.  Callers must not treat zero as end-of-stream while the
    /// producer is alive.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(0); // closed
        };

        let mut frontier = self.frontier.get();
        if self.position >= frontier {
            let deadline = Instant::now() + self.block_timeout;
            loop {
                tokio::time::sleep(self.poll_interval).await;
                frontier = self.frontier.get();
                if self.position < frontier {
                    break;
                }
                if Instant::now() >= deadline {
                    trace!(
                        "buffer: no data above {} within timeout",
                        self.position
                    );
                    return Ok(0);
                }
            }
        }

        let available = (frontier - self.position) as usize;
        let to_read = buf.len().min(available);
        file.seek(SeekFrom::Start(self.position))?;
        let n = file.read(&mut buf[..to_read])?;
        self.position += n as u64;
        Ok(n)
    }

    /// Releases the file handle.  Safe to call multiple times; subsequent
    /// reads return zero bytes.
    pub fn close(&mut self) {
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fast_config() -> BufferConfig {
        BufferConfig {
            poll_interval_ms: 10,
            block_timeout_ms: 80,
        }
    }

    fn write_buffer(dir: &Path, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.join("session.buf");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        path
    }

    #[tokio::test]
    async fn read_below_frontier_returns_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_buffer(dir.path(), b"abcdefgh");
        let frontier = Frontier::new();
        frontier.advance_to(8);

        let mut src = LiveBufferSource::open(&path, 0, frontier, &fast_config()).unwrap();
        let mut buf = [0u8; 4];
        let n = src.read(&mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..n], b"abcd");
        assert_eq!(src.position(), 4);

        // Never reads past the frontier even with a larger buffer.
        let mut buf = [0u8; 16];
        let n = src.read(&mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..n], b"efgh");
    }

    #[tokio::test]
    async fn read_at_frontier_times_out_with_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_buffer(dir.path(), b"abcd");
        let frontier = Frontier::new();
        frontier.advance_to(4);

        let mut src = LiveBufferSource::open(&path, 4, frontier, &fast_config()).unwrap();
        let mut buf = [0u8; 4];
        let n = src.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "timeout must yield zero bytes, not an error");
        // The source is still usable: not EOF.
        assert_eq!(src.position(), 4);
    }

    #[tokio::test]
    async fn read_unblocks_when_frontier_advances() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_buffer(dir.path(), b"abcd");
        let frontier = Frontier::new();
        frontier.advance_to(4);

        let mut src =
            LiveBufferSource::open(&path, 4, frontier.clone(), &fast_config()).unwrap();

        let writer_path = path.clone();
        let writer_frontier = frontier.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&writer_path)
                .unwrap();
            f.write_all(b"wxyz").unwrap();
            f.flush().unwrap();
            writer_frontier.advance_to(8);
        });

        let mut buf = [0u8; 8];
        let n = src.read(&mut buf).await.unwrap();
        assert!(n > 0, "read must unblock once new data is published");
        assert_eq!(&buf[..n], &b"wxyz"[..n]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = LiveBufferSource::open(
            &dir.path().join("absent.buf"),
            0,
            Frontier::new(),
            &fast_config(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_buffer(dir.path(), b"abcd");
        let frontier = Frontier::new();
        frontier.advance_to(4);

        let mut src = LiveBufferSource::open(&path, 0, frontier, &fast_config()).unwrap();
        src.close();
        src.close();
        let mut buf = [0u8; 4];
        assert_eq!(src.read(&mut buf).await.unwrap(), 0);
    }
}
