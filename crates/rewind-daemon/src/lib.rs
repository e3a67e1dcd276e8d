//! Timeshift radio daemon: records the live stream into a bounded local
//! buffer, serves it to the player over a local HTTP proxy, and exposes a
//! TCP control socket to presentation clients.

pub mod buffer;
pub mod controller;
pub mod network;
pub mod player;
pub mod proxy;
pub mod recorder;
pub mod socket;
pub mod state;

/// Fan-out from the controller to every connected control client.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    NowPlaying {
        title: String,
        artist: String,
        icon: String,
    },
    Log(String),
    Error(String),
}
