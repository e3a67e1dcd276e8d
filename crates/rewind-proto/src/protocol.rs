use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check it in the Hello broadcast and can refuse to
/// talk to an incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a presentation client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Start playing a station.  If another station is active it is fully
    /// torn down first.
    Play { name: String, url: String },
    Stop,
    TogglePause,
    /// Rewind into the timeshift buffer by `ms` milliseconds.
    SeekBackward { ms: u64 },
    /// Return to the live edge of the buffer.
    SeekToLive,
    Volume { value: f32 },
    GetState,
}

/// Messages sent from the daemon to presentation clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        rev: u64,
        state: SessionState,
    },
    State {
        data: SessionState,
    },
    /// Now-playing metadata for the OS media-session collaborator:
    /// station title, app label as artist, and an emoji icon.
    NowPlaying {
        title: String,
        artist: String,
        icon: String,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Playback session status as seen by presentation clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle, // nothing loaded / explicitly stopped
    Connecting, // stream loading, player buffering
    Playing,    // audio flowing
    Paused,     // explicitly paused
    Error,      // failed to play (connection failure)
}

/// Full state of the playback session.  `rev` is a monotonically increasing
/// counter incremented on every change; clients use it to detect missed
/// updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionState {
    /// Monotonic revision counter — incremented on every state change.
    #[serde(default)]
    pub rev: u64,
    pub status: PlaybackStatus,
    pub station_name: Option<String>,
    pub station_url: Option<String>,
    /// True when a timeshift buffer exists for the current session
    /// (raw single-stream URL, recorder started).
    #[serde(default)]
    pub has_timeshift: bool,
    /// True iff no rewind offset is applied — playback tracks the write
    /// frontier.
    #[serde(default = "default_true")]
    pub at_live: bool,
    /// Set when playback hit a transient network failure and the daemon is
    /// waiting for connectivity to return.  Presentation shows "starting",
    /// not an error.
    #[serde(default)]
    pub pending_retry: bool,
    /// Last connection failure, set on transition into Error and cleared on
    /// the next successful play or resume.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Bytes recorded so far in the timeshift buffer (the write frontier).
    #[serde(default)]
    pub buffered_bytes: u64,
    pub volume: f32,
}

fn default_true() -> bool {
    true
}

impl SessionState {
    pub fn is_playing(&self) -> bool {
        self.status == PlaybackStatus::Playing
    }
}

/// Wrapper for socket communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
