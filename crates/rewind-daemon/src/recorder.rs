//! Background recording of a live stream into a bounded local buffer file.
//!
//! One recorder per playback session.  The fetch task appends each received
//! chunk to the buffer file, flushes, and only then advances the shared
//! write frontier — a consumer never observes a length increase before the
//! bytes behind it are readable.  Recording stops silently once the size
//! cap is reached; playback keeps reading the buffered tail.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rewind_proto::config::RecorderConfig;

use crate::buffer::Frontier;

/// 8 KiB chunks are a hint only — reqwest delivers whatever the transport
/// produced, the cap logic never assumes a chunk size.
pub const CHUNK_SIZE_HINT: usize = 8 * 1024;

#[derive(Debug, Error, Clone)]
pub enum RecorderError {
    #[error("upstream returned HTTP {0}")]
    Http(u16),
    #[error("failed to connect to stream: {0}")]
    Connect(String),
    #[error("stream read failed: {0}")]
    Read(String),
    #[error("stream ended with empty body")]
    EmptyBody,
    #[error("buffer file i/o failed: {0}")]
    Io(String),
}

impl RecorderError {
    /// Transient failures are expected to resolve once connectivity
    /// returns; retry policy lives in the controller, not here.
    pub fn is_transient(&self) -> bool {
        matches!(self, RecorderError::Connect(_) | RecorderError::Read(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Stopped,
    Failed(String),
}

type ErrorCallback = Box<dyn FnOnce(RecorderError) + Send + 'static>;

pub struct StreamRecorder {
    url: String,
    path: PathBuf,
    config: RecorderConfig,
    frontier: Frontier,
    start_time_ms: Arc<AtomicU64>,
    recording: Arc<AtomicBool>,
    error_fired: Arc<AtomicBool>,
    state: Arc<Mutex<RecorderState>>,
    content_type: Arc<Mutex<Option<String>>>,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl StreamRecorder {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>, config: RecorderConfig) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
            config,
            frontier: Frontier::new(),
            start_time_ms: Arc::new(AtomicU64::new(0)),
            recording: Arc::new(AtomicBool::new(false)),
            error_fired: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(RecorderState::Idle)),
            content_type: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Total bytes durably written — the write frontier.  Safe from any
    /// thread, monotonically non-decreasing, never exceeds the cap.
    pub fn current_len(&self) -> u64 {
        self.frontier.get()
    }

    /// Cloneable read-only view of the frontier for consumers.
    pub fn frontier(&self) -> Frontier {
        self.frontier.clone()
    }

    /// Epoch millis of the first byte written; 0 until then.  Used for the
    /// bytes-per-millisecond seek rate estimate.
    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms.load(Ordering::Acquire)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn state(&self) -> RecorderState {
        self.state.lock().expect("recorder state lock").clone()
    }

    /// Content-Type reported by the upstream response, once known.
    pub fn content_type_handle(&self) -> Arc<Mutex<Option<String>>> {
        Arc::clone(&self.content_type)
    }

    pub fn buffer_path(&self) -> &Path {
        &self.path
    }

    /// Begins the asynchronous fetch.  A second call while recording is a
    /// no-op (first writer wins).  `on_error` is invoked at most once, for
    /// the first failure.
    ///
    /// The buffer file exists, empty, by the time this returns: consumers
    /// may open it at offset 0 right away and block at the zero frontier
    /// while the upstream connection is still being established.
    pub fn start(&mut self, on_error: ErrorCallback) {
        if self.recording.swap(true, Ordering::AcqRel) {
            debug!("recorder: start ignored, already recording");
            return;
        }
        if let Err(e) = std::fs::File::create(&self.path) {
            self.recording.store(false, Ordering::Release);
            *self.state.lock().expect("recorder state lock") =
                RecorderState::Failed(e.to_string());
            if !self.error_fired.swap(true, Ordering::AcqRel) {
                on_error(RecorderError::Io(e.to_string()));
            }
            return;
        }
        *self.state.lock().expect("recorder state lock") = RecorderState::Recording;

        let worker = Worker {
            url: self.url.clone(),
            path: self.path.clone(),
            config: self.config.clone(),
            frontier: self.frontier.clone(),
            start_time_ms: Arc::clone(&self.start_time_ms),
            recording: Arc::clone(&self.recording),
            error_fired: Arc::clone(&self.error_fired),
            state: Arc::clone(&self.state),
            content_type: Arc::clone(&self.content_type),
            cancel: self.cancel.clone(),
        };

        self.task = Some(tokio::spawn(async move {
            worker.run(on_error).await;
        }));
    }

    /// Cancels the in-flight fetch promptly and waits for the task to drop
    /// its file handle, so the buffer file is deletable immediately after
    /// this returns.  Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.recording.store(false, Ordering::Release);
        let mut state = self.state.lock().expect("recorder state lock");
        if !matches!(*state, RecorderState::Failed(_)) {
            *state = RecorderState::Stopped;
        }
    }
}

/// Everything the fetch task owns.
struct Worker {
    url: String,
    path: PathBuf,
    config: RecorderConfig,
    frontier: Frontier,
    start_time_ms: Arc<AtomicU64>,
    recording: Arc<AtomicBool>,
    error_fired: Arc<AtomicBool>,
    state: Arc<Mutex<RecorderState>>,
    content_type: Arc<Mutex<Option<String>>>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, on_error: ErrorCallback) {
        let outcome = self.record().await;
        self.recording.store(false, Ordering::Release);
        match outcome {
            Ok(()) => {
                let mut state = self.state.lock().expect("recorder state lock");
                if !matches!(*state, RecorderState::Failed(_)) {
                    *state = RecorderState::Stopped;
                }
            }
            Err(err) => {
                warn!("recorder: {} failed: {}", self.url, err);
                *self.state.lock().expect("recorder state lock") =
                    RecorderState::Failed(err.to_string());
                if !self.error_fired.swap(true, Ordering::AcqRel) {
                    on_error(err);
                }
            }
        }
    }

    async fn record(&self) -> Result<(), RecorderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(self.config.read_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(10))
            .default_headers({
                let mut h = reqwest::header::HeaderMap::new();
                h.insert(
                    "Icy-MetaData",
                    reqwest::header::HeaderValue::from_static("1"),
                );
                h
            })
            .build()
            .map_err(|e| RecorderError::Connect(e.to_string()))?;

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            result = client.get(&self.url).send() => {
                result.map_err(|e| RecorderError::Connect(e.to_string()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(RecorderError::Http(status.as_u16()));
        }
        if let Some(ct) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            *self.content_type.lock().expect("content type lock") = Some(ct.to_string());
        }

        // The file was created empty in start(); write into the file
        // consumers are already allowed to open.
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| RecorderError::Io(e.to_string()))?;
        let mut stream = response.bytes_stream();
        let max = self.config.max_buffer_bytes;
        let mut total: u64 = 0;

        info!("recorder: streaming {} into {:?}", self.url, self.path);

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("recorder: cancelled after {} bytes", total);
                    return Ok(());
                }
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    if self.start_time_ms.load(Ordering::Acquire) == 0 {
                        self.start_time_ms.store(now_ms(), Ordering::Release);
                    }
                    // Truncate the final chunk so the frontier never
                    // exceeds the cap.
                    let room = max.saturating_sub(total);
                    let take = (bytes.len() as u64).min(room) as usize;
                    file.write_all(&bytes[..take])
                        .await
                        .map_err(|e| RecorderError::Io(e.to_string()))?;
                    file.flush()
                        .await
                        .map_err(|e| RecorderError::Io(e.to_string()))?;
                    total += take as u64;
                    self.frontier.advance_to(total);
                    if total >= max {
                        info!("recorder: buffer cap {} reached, recording stops", max);
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(RecorderError::Read(e.to_string())),
                None => {
                    // A live stream should not end.  With nothing written it
                    // is an empty body; otherwise the upstream closed on us
                    // and the buffered tail remains playable.
                    if total == 0 {
                        return Err(RecorderError::EmptyBody);
                    }
                    info!("recorder: upstream closed after {} bytes", total);
                    return Ok(());
                }
            }
        }
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RecorderError::Connect("timeout".into()).is_transient());
        assert!(RecorderError::Read("reset".into()).is_transient());
        assert!(!RecorderError::Http(404).is_transient());
        assert!(!RecorderError::EmptyBody.is_transient());
        assert!(!RecorderError::Io("disk full".into()).is_transient());
    }

    #[tokio::test]
    async fn stop_before_start_is_harmless() {
        let mut rec = StreamRecorder::new(
            "http://127.0.0.1:9/none",
            std::env::temp_dir().join("rewind-test-noop.buf"),
            RecorderConfig::default(),
        );
        assert_eq!(rec.state(), RecorderState::Idle);
        rec.stop().await;
        rec.stop().await;
        assert_eq!(rec.state(), RecorderState::Stopped);
        assert_eq!(rec.current_len(), 0);
        assert!(!rec.is_recording());
    }
}
