//! mpv IPC driver — the external decoding collaborator.
//!
//! The daemon never touches audio itself: mpv is spawned idle with a JSON
//! IPC socket and pointed either directly at a manifest URL or at the local
//! buffer proxy.  One writer task serialises requests to the socket, one
//! reader task routes responses back by `request_id` and forwards
//! unsolicited events (property changes, end-file with an error string) to
//! the controller loop.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed observe_property IDs, matched in property-change events.
pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;
pub const OBS_TIME_POS: u64 = 3;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line, '\n' included
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event or property-change that arrived without a request_id.
#[derive(Debug, Clone)]
pub struct PlayerEvent {
    pub raw: Value,
}

impl PlayerEvent {
    /// `Some((obs_id, data))` for property-change events.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// For `end-file` events that carry an error, the mpv error string —
    /// the raw material for the transient/fatal classification.
    pub fn end_file_error(&self) -> Option<&str> {
        if self.event_name()? != "end-file" {
            return None;
        }
        if self.raw.get("reason")?.as_str()? != "error" {
            return None;
        }
        self.raw.get("file_error")?.as_str()
    }
}

/// Cheaply cloneable handle to the writer task.
#[derive(Clone)]
pub struct PlayerHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl PlayerHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("player writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("player IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("player reply channel dropped req={}", req_id))?
    }

    pub async fn load(&self, url: &str) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url])).await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        let _ = self.send(json!(["stop"])).await;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    pub async fn get_pause(&self) -> bool {
        match self.send(json!(["get_property", "pause"])).await {
            Ok(resp) => resp["data"].as_bool().unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        let pct = (volume * 100.0).clamp(0.0, 100.0);
        self.send(json!(["set_property", "volume", pct])).await?;
        Ok(())
    }

    /// True when mpv has nothing loaded / playback stalled out.
    pub async fn is_idle(&self) -> bool {
        match self.send(json!(["get_property", "core-idle"])).await {
            Ok(resp) => resp["data"].as_bool().unwrap_or(true),
            Err(_) => true,
        }
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        self.send(json!(["get_property", "volume"])).await?;
        Ok(())
    }

    /// Must be called after every fresh connection; mpv then pushes
    /// property-change events for everything the controller tracks.
    pub async fn observe_properties(&self) {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_PAUSE, "pause"),
            (OBS_TIME_POS, "time-pos"),
        ];
        for (id, name) in &props {
            if let Err(e) = self.send(json!(["observe_property", id, name])).await {
                warn!("player: observe_property {} failed: {}", name, e);
            }
        }
    }
}

/// Owns the mpv child process and manages (re)connection.
pub struct PlayerDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
}

impl PlayerDriver {
    pub fn new() -> Self {
        Self {
            socket_name: rewind_proto::platform::mpv_socket_name(),
            process: None,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process {
            Some(ref mut child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<PlayerEvent>,
        volume: f32,
    ) -> anyhow::Result<PlayerHandle> {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }

        let binary = find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        info!("player: spawning mpv");
        let vol_arg = format!("--volume={}", (volume * 100.0).clamp(0.0, 100.0).round() as i64);
        let child = tokio::process::Command::new(binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(rewind_proto::platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        self.process = Some(child);

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = UnixStream::connect(&socket_path).await?;
        info!("player: connected to IPC socket");
        Ok(start_io_tasks(stream, event_tx))
    }
}

fn start_io_tasks(stream: UnixStream, event_tx: mpsc::Sender<PlayerEvent>) -> PlayerHandle {
    let (read_half, write_half) = stream.into_split();
    let reader = BufReader::new(read_half);

    // req_id → reply channel; writer inserts, reader resolves.
    let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);
    tokio::spawn(writer_task(write_half, cmd_rx, Arc::clone(&pending)));
    tokio::spawn(reader_task(reader, pending, event_tx));

    PlayerHandle { tx: cmd_tx }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>,
    event_tx: mpsc::Sender<PlayerEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("player reader: connection closed");
                fail_pending(&pending, "player IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("player reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err =
                                val["error"].as_str().unwrap_or("unknown error").to_string();
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    }
                } else {
                    let _ = event_tx.send(PlayerEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("player reader: read error: {}", e);
                fail_pending(&pending, "player IPC read error").await;
                break;
            }
        }
    }
}

async fn fail_pending(
    pending: &Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>,
    reason: &str,
) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn writer_task<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<PendingRequest>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register the reply channel before writing so the reader can
        // match an immediate response.
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("player writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("player write error: {}", e)));
            }
            break;
        }
    }
    debug!("player writer: task exiting");
}

/// Looks for an mpv binary on PATH.
pub fn find_mpv_binary() -> Option<std::path::PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join("mpv");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_change_parsing() {
        let ev = PlayerEvent {
            raw: json!({"event": "property-change", "id": OBS_PAUSE, "data": true}),
        };
        let (id, data) = ev.as_property_change().unwrap();
        assert_eq!(id, OBS_PAUSE);
        assert_eq!(data.as_bool(), Some(true));

        let ev = PlayerEvent {
            raw: json!({"event": "end-file", "reason": "eof"}),
        };
        assert!(ev.as_property_change().is_none());
        assert_eq!(ev.event_name(), Some("end-file"));
    }

    #[test]
    fn end_file_error_extraction() {
        let ev = PlayerEvent {
            raw: json!({
                "event": "end-file",
                "reason": "error",
                "file_error": "loading failed"
            }),
        };
        assert_eq!(ev.end_file_error(), Some("loading failed"));

        let ev = PlayerEvent {
            raw: json!({"event": "end-file", "reason": "stop"}),
        };
        assert_eq!(ev.end_file_error(), None);
    }
}
