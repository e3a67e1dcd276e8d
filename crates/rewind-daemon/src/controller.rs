//! Playback orchestration.
//!
//! All external inputs — client commands, player events, recorder failure
//! notices, network-restored edges — arrive as `DaemonEvent` on one mpsc
//! channel consumed by a single loop, so station switches are serialized
//! structurally; the switch guard below additionally enforces the
//! one-recorder-per-file invariant even if a switch section ever becomes
//! reentrant.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use rewind_proto::catalog::icon_for_station;
use rewind_proto::config::Config;
use rewind_proto::protocol::{Command, PlaybackStatus};

use crate::player::{PlayerDriver, PlayerEvent, PlayerHandle, OBS_CORE_IDLE, OBS_PAUSE};
use crate::proxy::{self, LiveSession, SharedLiveSession};
use crate::recorder::{now_ms, RecorderError, StreamRecorder};
use crate::state::StateManager;
use crate::{network, BroadcastMessage};

#[derive(Debug)]
pub enum DaemonEvent {
    ClientCommand(Command),
    Player(PlayerEvent),
    RecorderFailed {
        generation: u64,
        error: RecorderError,
    },
    NetworkRestored,
}

/// An active timeshift recording session: one recorder, one buffer file,
/// one generation number tying proxy requests to this recorder lifetime.
struct TimeshiftSession {
    recorder: StreamRecorder,
    path: PathBuf,
    generation: u64,
}

/// Seek bookkeeping: the player reports no usable position for a live-style
/// source, so the current virtual position is extrapolated from the last
/// explicit seek.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SeekClock {
    last_seek_position_ms: u64,
    last_seek_time_ms: u64,
}

impl SeekClock {
    pub(crate) fn reset(&mut self, now: u64) {
        self.last_seek_position_ms = 0;
        self.last_seek_time_ms = now;
    }

    pub(crate) fn virtual_position(&self, now: u64) -> u64 {
        self.last_seek_position_ms + now.saturating_sub(self.last_seek_time_ms)
    }

    /// Target position after rewinding `ms`, clamped to the buffer start.
    pub(crate) fn rewind_target(&self, now: u64, ms: u64) -> u64 {
        self.virtual_position(now).saturating_sub(ms)
    }

    pub(crate) fn mark(&mut self, position_ms: u64, now: u64) {
        self.last_seek_position_ms = position_ms;
        self.last_seek_time_ms = now;
    }
}

/// Converts a time target into a byte offset using the observed average
/// rate since recording started.  Defaults to offset 0 while the rate is
/// not yet established.
pub(crate) fn seek_target_bytes(target_ms: u64, bytes_total: u64, elapsed_ms: u64) -> u64 {
    if elapsed_ms < 1 || bytes_total == 0 {
        return 0;
    }
    let bytes_per_ms = bytes_total / elapsed_ms;
    if bytes_per_ms == 0 {
        return 0;
    }
    (target_ms * bytes_per_ms).min(bytes_total)
}

/// Segmented/live-manifest streams are played natively by mpv without
/// local buffering.
pub(crate) fn is_manifest_url(url: &str) -> bool {
    url.to_lowercase().contains("m3u8")
}

/// Deterministic buffer file name keyed by the stream url.
pub(crate) fn buffer_file_name(url: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    url.hash(&mut hasher);
    format!("timeshift-{:x}.buf", hasher.finish())
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ErrorClass {
    /// Expected to resolve when connectivity returns; retry silently.
    Transient,
    /// Fell behind a live window; recover by snapping back to live.
    BehindLive,
    /// Everything else: stop and surface a connection failure.
    Fatal,
}

pub(crate) fn classify_player_error(message: &str) -> ErrorClass {
    let m = message.to_lowercase();
    if m.contains("behind") {
        return ErrorClass::BehindLive;
    }
    const TRANSIENT: [&str; 6] = [
        "timed out",
        "timeout",
        "connection reset",
        "connection refused",
        "network",
        "temporarily",
    ];
    if TRANSIENT.iter().any(|needle| m.contains(needle)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

pub struct PlaybackController {
    config: Config,
    state: Arc<StateManager>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    event_tx: mpsc::Sender<DaemonEvent>,
    driver: PlayerDriver,
    player_handle: Option<PlayerHandle>,
    session: Option<TimeshiftSession>,
    live_session: SharedLiveSession,
    watcher: Option<network::WatcherHandle>,
    clock: SeekClock,
    at_live: bool,
    pending_retry: bool,
    generation: u64,
    switch_lock: Arc<Mutex<()>>,
    current: Option<(String, String)>,
    volume: f32,
}

impl PlaybackController {
    pub fn new(
        config: Config,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.daemon.buffer_dir)?;
        let volume = config.player.default_volume;
        Ok(Self {
            state: Arc::new(StateManager::new(volume)),
            broadcast_tx,
            event_tx,
            driver: PlayerDriver::new(),
            player_handle: None,
            session: None,
            live_session: Arc::new(RwLock::new(None)),
            watcher: None,
            clock: SeekClock::default(),
            at_live: true,
            pending_retry: false,
            generation: 0,
            switch_lock: Arc::new(Mutex::new(())),
            current: None,
            volume,
            config,
        })
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state)
    }

    /// Shared with the buffer proxy server.
    pub fn live_session(&self) -> SharedLiveSession {
        Arc::clone(&self.live_session)
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(Duration::from_millis(1000));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    self.dispatch(event).await;
                }
                _ = tick.tick() => self.refresh_status().await,
            }
        }

        // Channel closed: leave nothing recording and no stray buffer file.
        self.teardown_all().await;
        self.driver.kill().await;
        Ok(())
    }

    async fn dispatch(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::ClientCommand(cmd) => self.handle_command(cmd).await,
            DaemonEvent::Player(ev) => self.handle_player_event(ev).await,
            DaemonEvent::RecorderFailed { generation, error } => {
                self.handle_recorder_failed(generation, error).await
            }
            DaemonEvent::NetworkRestored => self.handle_network_restored().await,
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Play { name, url } => {
                if let Err(e) = self.play_station(&name, &url).await {
                    error!("play {} failed: {}", name, e);
                    self.fail_playback(&e.to_string()).await;
                }
            }
            Command::Stop => self.stop_playback().await,
            Command::TogglePause => self.toggle_pause().await,
            Command::SeekBackward { ms } => self.seek_backward(ms).await,
            Command::SeekToLive => self.seek_to_live().await,
            Command::Volume { value } => self.set_volume(value).await,
            Command::GetState => self.notify_state(),
        }
    }

    // ── session lifecycle ─────────────────────────────────────────────────

    async fn play_station(&mut self, name: &str, url: &str) -> anyhow::Result<()> {
        let _guard = Arc::clone(&self.switch_lock).lock_owned().await;
        info!("play station '{}' ({})", name, url);

        // Fully quiesce the previous session before any new writer starts.
        self.teardown_session().await;

        if self.watcher.is_none() {
            self.watcher = Some(network::arm(
                self.config.network.clone(),
                self.event_tx.clone(),
            ));
        }

        self.current = Some((name.to_string(), url.to_string()));
        self.pending_retry = false;
        self.at_live = true;
        self.clock.reset(now_ms());

        let timeshift = !is_manifest_url(url);
        self.state.set_connecting(name, url, timeshift).await;

        if timeshift {
            let path = self.config.daemon.buffer_dir.join(buffer_file_name(url));
            let mut recorder =
                StreamRecorder::new(url, path.clone(), self.config.recorder.clone());

            self.generation += 1;
            let generation = self.generation;
            let event_tx = self.event_tx.clone();
            recorder.start(Box::new(move |err| {
                let _ = event_tx.try_send(DaemonEvent::RecorderFailed {
                    generation,
                    error: err,
                });
            }));

            *self.live_session.write().await = Some(LiveSession {
                generation,
                path: path.clone(),
                frontier: recorder.frontier(),
                content_type: recorder.content_type_handle(),
            });

            let offset = recorder.current_len();
            self.session = Some(TimeshiftSession {
                recorder,
                path,
                generation,
            });

            if let Some(player) = self.ensure_player().await {
                let live = proxy::live_url(self.config.proxy.port, generation, offset);
                if let Err(e) = player.load(&live).await {
                    warn!("player load failed: {}", e);
                }
            }
        } else {
            *self.live_session.write().await = None;
            if let Some(player) = self.ensure_player().await {
                if let Err(e) = player.load(url).await {
                    warn!("player load failed: {}", e);
                }
            }
        }

        self.notify_state();
        let _ = self.broadcast_tx.send(BroadcastMessage::NowPlaying {
            title: name.to_string(),
            artist: "rewind radio".to_string(),
            icon: icon_for_station(name, url).to_string(),
        });
        Ok(())
    }

    /// Stops the recorder (awaiting its task, so the file handle is gone)
    /// and deletes the buffer file.  The proxy session is cleared first so
    /// no new reader attaches against a dying generation.
    async fn teardown_session(&mut self) {
        *self.live_session.write().await = None;
        if let Some(mut session) = self.session.take() {
            session.recorder.stop().await;
            match tokio::fs::remove_file(&session.path).await {
                Ok(()) => debug!("deleted buffer {:?}", session.path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to delete buffer {:?}: {}", session.path, e),
            }
        }
    }

    async fn teardown_all(&mut self) {
        self.pending_retry = false;
        if let Some(watcher) = self.watcher.take() {
            watcher.disarm();
        }
        self.teardown_session().await;
        if let Some(player) = &self.player_handle {
            let _ = player.stop().await;
        }
        self.current = None;
    }

    async fn stop_playback(&mut self) {
        info!("stop playback");
        self.teardown_all().await;
        self.state.set_stopped().await;
        self.notify_state();
    }

    /// Teardown plus an Error status carrying the cause — used for fatal
    /// stream failures, where `stop` would wrongly report a clean Idle.
    async fn fail_playback(&mut self, message: &str) {
        error!("playback failed: {}", message);
        self.teardown_all().await;
        self.state.set_error(message).await;
        let _ = self.broadcast_tx.send(BroadcastMessage::Error(message.to_string()));
        self.notify_state();
    }

    // ── seeking ───────────────────────────────────────────────────────────

    async fn seek_backward(&mut self, ms: u64) {
        let Some((generation, bytes_total, start)) = self
            .session
            .as_ref()
            .map(|s| (s.generation, s.recorder.current_len(), s.recorder.start_time_ms()))
        else {
            debug!("seek_backward ignored: no timeshift session");
            return;
        };

        let now = now_ms();
        let target_ms = self.clock.rewind_target(now, ms);
        let elapsed_ms = if start == 0 {
            0
        } else {
            now.saturating_sub(start).max(1)
        };
        let offset = seek_target_bytes(target_ms, bytes_total, elapsed_ms);
        info!(
            "seek backward {} ms → position {} ms, byte offset {} of {}",
            ms, target_ms, offset, bytes_total
        );

        if let Some(player) = self.ensure_player().await {
            let live = proxy::live_url(self.config.proxy.port, generation, offset);
            if let Err(e) = player.load(&live).await {
                warn!("player reload failed: {}", e);
            }
        }

        self.at_live = false;
        self.clock.mark(target_ms, now);
        self.state.set_at_live(false).await;
        self.notify_state();
    }

    async fn seek_to_live(&mut self) {
        let Some((generation, frontier)) = self
            .session
            .as_ref()
            .map(|s| (s.generation, s.recorder.current_len()))
        else {
            debug!("seek_to_live ignored: no timeshift session");
            return;
        };

        info!("seek to live edge at byte {}", frontier);
        if let Some(player) = self.ensure_player().await {
            let live = proxy::live_url(self.config.proxy.port, generation, frontier);
            if let Err(e) = player.load(&live).await {
                warn!("player reload failed: {}", e);
            }
        }

        self.at_live = true;
        self.clock.reset(now_ms());
        self.state.set_at_live(true).await;
        self.notify_state();
    }

    // ── player plumbing ───────────────────────────────────────────────────

    async fn ensure_player(&mut self) -> Option<PlayerHandle> {
        if let Some(handle) = &self.player_handle {
            if self.driver.process_alive() {
                return Some(handle.clone());
            }
        }

        let (tx, mut rx) = mpsc::channel::<PlayerEvent>(64);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if event_tx.send(DaemonEvent::Player(ev)).await.is_err() {
                    break;
                }
            }
        });

        match self.driver.spawn_and_connect(tx, self.volume).await {
            Ok(handle) => {
                handle.observe_properties().await;
                self.player_handle = Some(handle.clone());
                Some(handle)
            }
            Err(e) => {
                // The engine still records without a player; audio resumes
                // once mpv becomes available on the next load.
                warn!("player unavailable: {}", e);
                self.player_handle = None;
                None
            }
        }
    }

    async fn handle_player_event(&mut self, ev: PlayerEvent) {
        if let Some((id, data)) = ev.as_property_change() {
            match id {
                OBS_CORE_IDLE => {
                    if data.as_bool() == Some(false) && self.current.is_some() {
                        self.pending_retry = false;
                        self.state.mark_playing().await;
                        self.notify_state();
                    }
                }
                OBS_PAUSE => {
                    if let Some(paused) = data.as_bool() {
                        if self.current.is_some() && !self.pending_retry {
                            let status = if paused {
                                PlaybackStatus::Paused
                            } else {
                                PlaybackStatus::Playing
                            };
                            self.state.set_status(status).await;
                            self.notify_state();
                        }
                    }
                }
                _ => {}
            }
            return;
        }

        if let Some(err) = ev.end_file_error() {
            let message = err.to_string();
            self.handle_player_error(&message).await;
        }
    }

    async fn handle_player_error(&mut self, message: &str) {
        match classify_player_error(message) {
            ErrorClass::BehindLive => {
                // Fell out of the live window: snap back to the default
                // position silently.
                info!("player behind live window, resetting to live");
                if self.session.is_some() {
                    self.seek_to_live().await;
                } else if let Some((_, url)) = self.current.clone() {
                    if let Some(player) = self.ensure_player().await {
                        let _ = player.load(&url).await;
                    }
                }
            }
            ErrorClass::Transient => {
                info!("transient player error, waiting for network: {}", message);
                self.pending_retry = true;
                self.state.set_pending_retry(true).await;
                self.notify_state();
            }
            ErrorClass::Fatal => {
                self.fail_playback(message).await;
            }
        }
    }

    async fn handle_recorder_failed(&mut self, generation: u64, error: RecorderError) {
        if self.session.as_ref().map(|s| s.generation) != Some(generation) {
            debug!("ignoring failure from stale recorder generation {}", generation);
            return;
        }
        if error.is_transient() {
            info!("transient recorder error, waiting for network: {}", error);
            self.pending_retry = true;
            self.state.set_pending_retry(true).await;
            self.notify_state();
        } else {
            self.fail_playback(&error.to_string()).await;
        }
    }

    /// Connectivity came back.  Resume without user action when a retry is
    /// pending or the player has nothing flowing.
    async fn handle_network_restored(&mut self) {
        let Some((name, url)) = self.current.clone() else {
            return;
        };

        let player_idle = match &self.player_handle {
            Some(handle) => handle.is_idle().await,
            None => true,
        };
        if !self.pending_retry && !player_idle {
            return;
        }

        info!("network restored, resuming '{}'", name);
        self.pending_retry = false;
        self.state.set_pending_retry(false).await;

        if is_manifest_url(&url) {
            self.state.set_status(PlaybackStatus::Connecting).await;
            if let Some(player) = self.ensure_player().await {
                let _ = player.load(&url).await;
            }
            self.notify_state();
            return;
        }

        let recorder_alive = self
            .session
            .as_ref()
            .map(|s| s.recorder.is_recording())
            .unwrap_or(false);
        if !recorder_alive {
            // The recorder died with the network: re-prepare the whole
            // session (fresh buffer, fresh generation).
            if let Err(e) = self.play_station(&name, &url).await {
                self.fail_playback(&e.to_string()).await;
            }
        } else if self.at_live {
            self.seek_to_live().await;
        } else {
            // Resume from the current virtual position.
            self.seek_backward(0).await;
        }
    }

    async fn toggle_pause(&mut self) {
        let Some(player) = self.player_handle.clone() else {
            return;
        };
        let paused = player.get_pause().await;
        if player.set_pause(!paused).await.is_ok() {
            let status = if paused {
                PlaybackStatus::Playing
            } else {
                PlaybackStatus::Paused
            };
            self.state.set_status(status).await;
            self.notify_state();
        }
    }

    async fn set_volume(&mut self, value: f32) {
        self.volume = value.clamp(0.0, 1.0);
        if let Some(player) = &self.player_handle {
            let _ = player.set_volume(self.volume).await;
        }
        self.state.set_volume(self.volume).await;
        self.notify_state();
    }

    async fn refresh_status(&mut self) {
        let Some(session) = &self.session else { return };
        let before = self.state.get_state().await.rev;
        self.state
            .set_buffered_bytes(session.recorder.current_len())
            .await;
        if self.state.get_state().await.rev != before {
            self.notify_state();
        }
    }

    fn notify_state(&self) {
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }
}
