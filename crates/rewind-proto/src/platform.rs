use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9877;
const DAEMON_TCP_HOST: &str = "127.0.0.1";

pub fn daemon_address() -> String {
    format!("{}:{}", DAEMON_TCP_HOST, DAEMON_TCP_PORT)
}

pub fn mpv_socket_name() -> String {
    format!("{}/rewind-mpv.sock", std::env::temp_dir().display())
}

pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server={}", mpv_socket_name())
}

/// Data directory: `~/.local/share/rewind/` (XDG layout, also used on macOS
/// for consistency).  Holds the log file, persisted state, and the buffer
/// directory.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".local")
        .join("share")
        .join("rewind")
}

/// Config directory: `~/.config/rewind/`.
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("rewind")
}

/// Directory for ephemeral timeshift buffer files.  Contents are deleted on
/// session end and are never expected to survive a restart.
pub fn buffer_dir() -> PathBuf {
    data_dir().join("buffers")
}
