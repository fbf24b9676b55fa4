use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;
use super::protocol::{DEFAULT_CONTROL_PORT, DEFAULT_STREAM_PATH};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub sim: SimConfig,
}

/// Where the door unit lives and how long to wait for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    /// Bound on a single start/stop command round-trip.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

/// How the step between remote ack and decoder initialisation waits for the
/// door unit's feed to come up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// Sleep `settle_ms`.
    #[default]
    Fixed,
    /// Poll the stream URL every `probe_interval_ms` until frames arrive.
    Probe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bound on remote ack + settle + decoder initialise.
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default)]
    pub readiness: Readiness,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Bound on teardown when the host goes away.
    #[serde(default = "default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DecoderConfig {
    /// Explicit mpv binary; searched for when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpv_path: Option<PathBuf>,
    /// Extra arguments appended to the mpv command line.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default = "default_sim_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
    #[serde(default = "default_sim_fps")]
    pub fps: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            control_port: default_control_port(),
            stream_path: default_stream_path(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: default_start_timeout_ms(),
            settle_ms: default_settle_ms(),
            readiness: Readiness::default(),
            probe_interval_ms: default_probe_interval_ms(),
            teardown_grace_ms: default_teardown_grace_ms(),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            bind_address: default_sim_bind_address(),
            port: default_control_port(),
            fps: default_sim_fps(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_stream_path() -> String {
    DEFAULT_STREAM_PATH.to_string()
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

fn default_start_timeout_ms() -> u64 {
    15_000
}

fn default_settle_ms() -> u64 {
    1_000
}

fn default_probe_interval_ms() -> u64 {
    250
}

fn default_teardown_grace_ms() -> u64 {
    3_000
}

fn default_sim_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_sim_fps() -> u32 {
    15
}

impl DeviceConfig {
    /// Base URL of the control endpoint, e.g. `http://10.0.0.5:8080`.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.control_port)
    }

    pub fn stream_url(&self) -> String {
        let path = self.stream_path.trim_start_matches('/');
        format!("{}/{}", self.base_url(), path)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl SessionConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

impl Config {
    /// Load from the default location, writing defaults on first run.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
