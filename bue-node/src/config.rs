use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_ENV: &str = "BUE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Node settings, keyed the same way as the deployed `config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct NodeConfig {
    pub ota_port: String,
    pub ota_baudrate: u32,
    pub ota_id: u16,
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_connect_interval")]
    pub connect_interval_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    #[serde(default = "default_max_missed")]
    pub max_missed_pings: u32,
    #[serde(default = "default_update_pacing")]
    pub update_pacing_ms: u64,

    #[serde(default = "default_runner")]
    pub test_runner: Vec<String>,
    #[serde(default = "default_suffix")]
    pub test_script_suffix: String,
    #[serde(default = "default_test_dir")]
    pub test_dir: String,
    #[serde(default = "default_marker")]
    pub output_marker: String,
    #[serde(default = "default_buffer_lines")]
    pub output_buffer_lines: usize,

    #[serde(default = "default_reload")]
    pub reload_command: Vec<String>,
    #[serde(default = "default_restart")]
    pub restart_command: Vec<String>,

    #[serde(default = "default_gpsd")]
    pub gpsd_addr: String,
    #[serde(default = "default_gps_timeout")]
    pub gps_timeout_secs: u64,
    #[serde(default = "default_gps_fixes")]
    pub gps_min_fixes: usize,
}

fn default_tick_ms() -> u64 { 10 }
fn default_connect_interval() -> u64 { 1 }
fn default_ping_interval() -> u64 { 10 }
fn default_update_interval() -> u64 { 10 }
fn default_max_missed() -> u32 { 6 }
fn default_update_pacing() -> u64 { 400 }
fn default_runner() -> Vec<String> { vec!["python3".into()] }
fn default_suffix() -> String { ".py".into() }
fn default_test_dir() -> String { ".".into() }
fn default_marker() -> String { "rx msg:".into() }
fn default_buffer_lines() -> usize { 256 }
fn default_reload() -> Vec<String> {
    ["sudo", "systemctl", "restart", "bue.service"].map(String::from).to_vec()
}
fn default_restart() -> Vec<String> { ["sudo", "reboot"].map(String::from).to_vec() }
fn default_gpsd() -> String { "127.0.0.1:2947".into() }
fn default_gps_timeout() -> u64 { 10 }
fn default_gps_fixes() -> usize { 3 }

impl NodeConfig {
    pub fn from_yaml(txt: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(txt)?)
    }

    /// Reads the file named by `BUE_CONFIG` (default `config.yaml`).
    pub async fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        if !Path::new(&path).exists() {
            return Err(ConfigError::NotFound(path));
        }
        let txt = tokio::fs::read_to_string(&path).await?;
        Self::from_yaml(&txt)
    }

    /// Configured hostname, falling back to the machine's.
    pub fn hostname(&self) -> String {
        match &self.hostname {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    /// Number of ticks in `secs`, never less than one.
    pub fn ticks_per(&self, secs: u64) -> u32 {
        let ticks = secs.saturating_mul(1000) / self.tick_ms.max(1);
        ticks.clamp(1, u32::MAX as u64) as u32
    }

    pub fn update_pacing(&self) -> Duration {
        Duration::from_millis(self.update_pacing_ms)
    }
}
