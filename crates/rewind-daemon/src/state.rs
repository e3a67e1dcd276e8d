//! Shared session state handed out to the control socket.
//!
//! Unlike the station catalog this is purely in-memory: the timeshift buffer
//! does not survive a restart, so neither does the session.  Every mutation
//! bumps `rev` so clients can detect missed updates.

use rewind_proto::protocol::{PlaybackStatus, SessionState};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct StateManager {
    state: Arc<RwLock<SessionState>>,
}

impl StateManager {
    pub fn new(volume: f32) -> Self {
        let state = SessionState {
            rev: 1,
            at_live: true,
            volume,
            ..Default::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn get_state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    /// Entering a new session: station set, previous error and retry flag
    /// cleared, seek offset reset to live.
    pub async fn set_connecting(&self, name: &str, url: &str, has_timeshift: bool) {
        let mut state = self.state.write().await;
        state.status = PlaybackStatus::Connecting;
        state.station_name = Some(name.to_string());
        state.station_url = Some(url.to_string());
        state.has_timeshift = has_timeshift;
        state.at_live = true;
        state.pending_retry = false;
        state.last_error = None;
        state.buffered_bytes = 0;
        state.rev += 1;
    }

    pub async fn set_status(&self, status: PlaybackStatus) {
        let mut state = self.state.write().await;
        state.status = status;
        state.rev += 1;
    }

    pub async fn set_stopped(&self) {
        let mut state = self.state.write().await;
        state.status = PlaybackStatus::Idle;
        state.station_name = None;
        state.station_url = None;
        state.has_timeshift = false;
        state.at_live = true;
        state.pending_retry = false;
        state.buffered_bytes = 0;
        state.rev += 1;
    }

    /// Connection failure: status Error and the cause recorded on the
    /// session.  Cleared by the next successful play or resume.
    pub async fn set_error(&self, message: &str) {
        let mut state = self.state.write().await;
        state.status = PlaybackStatus::Error;
        state.pending_retry = false;
        state.last_error = Some(message.to_string());
        state.rev += 1;
    }

    /// Audio started flowing: any earlier error or silent retry is over.
    pub async fn mark_playing(&self) {
        let mut state = self.state.write().await;
        state.status = PlaybackStatus::Playing;
        state.pending_retry = false;
        state.last_error = None;
        state.rev += 1;
    }

    pub async fn set_pending_retry(&self, pending: bool) {
        let mut state = self.state.write().await;
        state.pending_retry = pending;
        if pending {
            // Retry is silent: presentation shows "starting", not an error.
            state.status = PlaybackStatus::Connecting;
        }
        state.rev += 1;
    }

    pub async fn set_at_live(&self, at_live: bool) {
        let mut state = self.state.write().await;
        state.at_live = at_live;
        state.rev += 1;
    }

    pub async fn set_buffered_bytes(&self, bytes: u64) {
        let mut state = self.state.write().await;
        if state.buffered_bytes != bytes {
            state.buffered_bytes = bytes;
            state.rev += 1;
        }
    }

    pub async fn set_volume(&self, volume: f32) {
        let mut state = self.state.write().await;
        state.volume = volume.clamp(0.0, 1.0);
        state.rev += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connecting_clears_previous_error() {
        let sm = StateManager::new(0.5);
        sm.set_error("connection failed").await;
        let s = sm.get_state().await;
        assert_eq!(s.status, PlaybackStatus::Error);
        assert!(s.last_error.is_some());

        sm.set_connecting("Test FM", "http://example.com/s", true).await;
        let s = sm.get_state().await;
        assert_eq!(s.status, PlaybackStatus::Connecting);
        assert!(s.last_error.is_none());
        assert!(!s.pending_retry);
        assert!(s.at_live);
    }

    #[tokio::test]
    async fn rev_increments_on_change() {
        let sm = StateManager::new(0.5);
        let before = sm.get_state().await.rev;
        sm.set_status(PlaybackStatus::Playing).await;
        sm.set_buffered_bytes(1024).await;
        // Unchanged value does not bump rev.
        sm.set_buffered_bytes(1024).await;
        let after = sm.get_state().await.rev;
        assert_eq!(after, before + 2);
    }
}
