//! Controller-level session tests driven through the daemon event channel,
//! the same path the control socket uses.  Runs without a player binary:
//! the controller records and manages state regardless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::sync::{broadcast, mpsc};

use rewind_daemon::controller::{DaemonEvent, PlaybackController};
use rewind_daemon::player::PlayerEvent;
use rewind_daemon::state::StateManager;
use rewind_daemon::BroadcastMessage;
use serde_json::json;
use rewind_proto::config::Config;
use rewind_proto::protocol::{Command, PlaybackStatus};

/// Endless byte stream, or a short stream ending in a connection error
/// while `fail` is set.
async fn spawn_upstream(fail: Arc<AtomicBool>) -> (String, tokio::task::JoinHandle<()>) {
    let app = Router::new().route(
        "/stream",
        get(move || {
            let fail = Arc::clone(&fail);
            async move {
                let failing = fail.load(Ordering::SeqCst);
                let stream = futures_util::stream::unfold(0u32, move |i| async move {
                    if failing && i == 2 {
                        return Some((
                            Err(std::io::Error::new(
                                std::io::ErrorKind::ConnectionReset,
                                "connection reset",
                            )),
                            i + 1,
                        ));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Some((Ok(vec![0u8; 512]), i + 1))
                });
                Response::builder()
                    .status(200)
                    .header("content-type", "audio/mpeg")
                    .body(Body::from_stream(stream))
                    .unwrap()
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{}/stream", addr), handle)
}

struct Harness {
    tx: mpsc::Sender<DaemonEvent>,
    state: Arc<StateManager>,
    buffer_dir: std::path::PathBuf,
    _tempdir: tempfile::TempDir,
    _broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

async fn start_daemon() -> Harness {
    // No player binary: playback state is still managed, audio is skipped.
    std::env::set_var("PATH", "");

    let tempdir = tempfile::tempdir().unwrap();
    let buffer_dir = tempdir.path().join("buffers");

    let mut config = Config::default();
    config.daemon.buffer_dir = buffer_dir.clone();
    config.buffer.poll_interval_ms = 10;
    config.buffer.block_timeout_ms = 200;
    // Probe a local closed port so the watcher never leaves the machine.
    config.network.probe_address = "127.0.0.1:1".to_string();
    config.network.probe_interval_ms = 60_000;

    let (broadcast_tx, _) = broadcast::channel(100);
    let (tx, rx) = mpsc::channel(256);
    let controller =
        PlaybackController::new(config, broadcast_tx.clone(), tx.clone()).unwrap();
    let state = controller.state_manager();
    tokio::spawn(controller.run(rx));

    Harness {
        tx,
        state,
        buffer_dir,
        _tempdir: tempdir,
        _broadcast_tx: broadcast_tx,
    }
}

fn buffer_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}

async fn wait_for_state(
    state: &StateManager,
    mut cond: impl FnMut(&rewind_proto::protocol::SessionState) -> bool,
    limit: Duration,
) -> rewind_proto::protocol::SessionState {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let s = state.get_state().await;
        if cond(&s) || tokio::time::Instant::now() >= deadline {
            return s;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn switching_stations_keeps_a_single_buffer_file() {
    let h = start_daemon().await;
    let (url_a, server_a) = spawn_upstream(Arc::new(AtomicBool::new(false))).await;
    let (url_b, server_b) = spawn_upstream(Arc::new(AtomicBool::new(false))).await;

    h.tx.send(DaemonEvent::ClientCommand(Command::Play {
        name: "Station A".into(),
        url: url_a.clone(),
    }))
    .await
    .unwrap();

    let s = wait_for_state(
        &h.state,
        |s| s.station_url.as_deref() == Some(url_a.as_str()),
        Duration::from_secs(3),
    )
    .await;
    assert!(s.has_timeshift);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(buffer_files(&h.buffer_dir).len(), 1);

    h.tx.send(DaemonEvent::ClientCommand(Command::Play {
        name: "Station B".into(),
        url: url_b.clone(),
    }))
    .await
    .unwrap();

    wait_for_state(
        &h.state,
        |s| s.station_url.as_deref() == Some(url_b.as_str()),
        Duration::from_secs(3),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The previous session's recorder is stopped and its file deleted
    // before the new one starts writing.
    assert_eq!(buffer_files(&h.buffer_dir).len(), 1);

    server_a.abort();
    server_b.abort();
}

#[tokio::test]
async fn stop_deletes_the_buffer_and_goes_idle() {
    let h = start_daemon().await;
    let (url, server) = spawn_upstream(Arc::new(AtomicBool::new(false))).await;

    h.tx.send(DaemonEvent::ClientCommand(Command::Play {
        name: "Station".into(),
        url,
    }))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(buffer_files(&h.buffer_dir).len(), 1);

    h.tx.send(DaemonEvent::ClientCommand(Command::Stop))
        .await
        .unwrap();

    let s = wait_for_state(
        &h.state,
        |s| s.status == PlaybackStatus::Idle,
        Duration::from_secs(3),
    )
    .await;
    assert_eq!(s.status, PlaybackStatus::Idle);
    assert!(s.station_name.is_none());
    assert!(!s.has_timeshift);
    assert!(buffer_files(&h.buffer_dir).is_empty());

    server.abort();
}

#[tokio::test]
async fn transient_failure_resumes_on_network_restore() {
    let h = start_daemon().await;
    let fail = Arc::new(AtomicBool::new(true));
    let (url, server) = spawn_upstream(Arc::clone(&fail)).await;

    h.tx.send(DaemonEvent::ClientCommand(Command::Play {
        name: "Flaky".into(),
        url: url.clone(),
    }))
    .await
    .unwrap();

    // The stream drops mid-read: a transient failure, so the session waits
    // silently instead of surfacing an error.
    let s = wait_for_state(&h.state, |s| s.pending_retry, Duration::from_secs(3)).await;
    assert!(s.pending_retry);
    assert_eq!(s.status, PlaybackStatus::Connecting);
    assert!(s.last_error.is_none());

    // Connectivity returns and the upstream behaves again.
    fail.store(false, Ordering::SeqCst);
    h.tx.send(DaemonEvent::NetworkRestored).await.unwrap();

    let s = wait_for_state(
        &h.state,
        |s| !s.pending_retry && s.buffered_bytes > 0,
        Duration::from_secs(5),
    )
    .await;
    assert!(!s.pending_retry);
    assert!(s.buffered_bytes > 0, "recording did not resume");
    assert_eq!(s.station_url.as_deref(), Some(url.as_str()));

    server.abort();
}

#[tokio::test]
async fn seeking_tracks_the_live_edge_flag() {
    let h = start_daemon().await;
    let (url, server) = spawn_upstream(Arc::new(AtomicBool::new(false))).await;

    h.tx.send(DaemonEvent::ClientCommand(Command::Play {
        name: "Station".into(),
        url,
    }))
    .await
    .unwrap();
    wait_for_state(&h.state, |s| s.has_timeshift, Duration::from_secs(3)).await;

    h.tx.send(DaemonEvent::ClientCommand(Command::SeekBackward { ms: 2000 }))
        .await
        .unwrap();
    let s = wait_for_state(&h.state, |s| !s.at_live, Duration::from_secs(3)).await;
    assert!(!s.at_live);

    h.tx.send(DaemonEvent::ClientCommand(Command::SeekToLive))
        .await
        .unwrap();
    let s = wait_for_state(&h.state, |s| s.at_live, Duration::from_secs(3)).await;
    assert!(s.at_live);

    server.abort();
}

fn end_file_error(message: &str) -> DaemonEvent {
    DaemonEvent::Player(PlayerEvent {
        raw: json!({
            "event": "end-file",
            "reason": "error",
            "file_error": message,
        }),
    })
}

#[tokio::test]
async fn behind_live_player_error_snaps_back_to_live_silently() {
    let h = start_daemon().await;
    let (url, server) = spawn_upstream(Arc::new(AtomicBool::new(false))).await;

    h.tx.send(DaemonEvent::ClientCommand(Command::Play {
        name: "Station".into(),
        url,
    }))
    .await
    .unwrap();
    wait_for_state(&h.state, |s| s.has_timeshift, Duration::from_secs(3)).await;

    // Rewind away from the live edge first so the recovery is observable.
    h.tx.send(DaemonEvent::ClientCommand(Command::SeekBackward { ms: 2000 }))
        .await
        .unwrap();
    wait_for_state(&h.state, |s| !s.at_live, Duration::from_secs(3)).await;

    h.tx.send(end_file_error("fell behind the live window"))
        .await
        .unwrap();

    // Recovery is a silent jump to live: no Error status, nothing torn down.
    let s = wait_for_state(&h.state, |s| s.at_live, Duration::from_secs(3)).await;
    assert!(s.at_live);
    assert_ne!(s.status, PlaybackStatus::Error);
    assert!(s.last_error.is_none());
    assert!(!s.pending_retry);
    assert!(s.station_name.is_some());
    assert_eq!(buffer_files(&h.buffer_dir).len(), 1);

    server.abort();
}

#[tokio::test]
async fn transient_player_error_waits_for_network() {
    let h = start_daemon().await;
    let (url, server) = spawn_upstream(Arc::new(AtomicBool::new(false))).await;

    h.tx.send(DaemonEvent::ClientCommand(Command::Play {
        name: "Station".into(),
        url,
    }))
    .await
    .unwrap();
    wait_for_state(&h.state, |s| s.has_timeshift, Duration::from_secs(3)).await;

    h.tx.send(end_file_error("connection reset by peer"))
        .await
        .unwrap();

    // A retryable player failure keeps the session alive and shows
    // "starting", not an error.
    let s = wait_for_state(&h.state, |s| s.pending_retry, Duration::from_secs(3)).await;
    assert!(s.pending_retry);
    assert_eq!(s.status, PlaybackStatus::Connecting);
    assert!(s.last_error.is_none());
    assert!(s.station_name.is_some());
    assert_eq!(buffer_files(&h.buffer_dir).len(), 1);

    server.abort();
}

#[tokio::test]
async fn fatal_upstream_error_reports_and_cleans_up() {
    let h = start_daemon().await;

    // 404 from the upstream is not retryable.
    let app = Router::new();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    h.tx.send(DaemonEvent::ClientCommand(Command::Play {
        name: "Missing".into(),
        url: format!("http://{}/nothing", addr),
    }))
    .await
    .unwrap();

    let s = wait_for_state(
        &h.state,
        |s| s.status == PlaybackStatus::Error,
        Duration::from_secs(3),
    )
    .await;
    assert_eq!(s.status, PlaybackStatus::Error);
    assert!(s.last_error.as_deref().unwrap_or("").contains("404"));
    assert!(buffer_files(&h.buffer_dir).is_empty());

    server.abort();
}
