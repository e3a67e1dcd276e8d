use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub player: PlayerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    /// Directory for ephemeral timeshift buffer files; cleaned per session.
    #[serde(default = "default_buffer_dir")]
    pub buffer_dir: PathBuf,
}

/// TCP control socket for presentation clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
}

/// Local HTTP endpoint that serves the timeshift buffer to the player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Hard cap on the buffer file.  30 MiB ≈ 25–30 min at 128 kbps;
    /// recording stops silently once reached.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

/// LiveBufferSource read contract: poll the write frontier at
/// `poll_interval_ms` and give up (returning a zero-length read, not EOF)
/// after `block_timeout_ms` without new data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,
}

/// Connectivity probe used to detect network restoration during a
/// pending-retry phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_probe_address")]
    pub probe_address: String,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Path to the persisted station catalog (JSON).
    #[serde(default = "default_stations_file")]
    pub stations_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            buffer_dir: default_buffer_dir(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_control_port(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_proxy_port(),
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: default_max_buffer_bytes(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            block_timeout_ms: default_block_timeout_ms(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_address: default_probe_address(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            stations_file: default_stations_file(),
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
        }
    }
}

fn default_pid_file() -> PathBuf {
    platform::data_dir().join("daemon.pid")
}

fn default_buffer_dir() -> PathBuf {
    platform::buffer_dir()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_proxy_port() -> u16 {
    8991
}

fn default_max_buffer_bytes() -> u64 {
    30 * 1024 * 1024
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_block_timeout_ms() -> u64 {
    5000
}

fn default_probe_address() -> String {
    "1.1.1.1:53".to_string()
}

fn default_probe_interval_ms() -> u64 {
    2000
}

fn default_probe_timeout_ms() -> u64 {
    1500
}

fn default_stations_file() -> PathBuf {
    platform::data_dir().join("stations.json")
}

fn default_volume() -> f32 {
    0.5
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.control.bind_address, "127.0.0.1");
        assert_eq!(config.recorder.max_buffer_bytes, 30 * 1024 * 1024);
        assert_eq!(config.buffer.poll_interval_ms, 100);
        assert_eq!(config.buffer.block_timeout_ms, 5000);
        assert!(config.catalog.stations_file.ends_with("rewind/stations.json"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [recorder]
            max_buffer_bytes = 1048576
            "#,
        )
        .unwrap();
        assert_eq!(config.recorder.max_buffer_bytes, 1_048_576);
        assert_eq!(config.recorder.connect_timeout_secs, 15);
        assert_eq!(config.buffer.block_timeout_ms, 5000);
    }
}
