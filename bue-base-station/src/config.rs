use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_ENV: &str = "BUE_BASE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config_base.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct BaseConfig {
    pub ota_port: String,
    pub ota_baudrate: u32,
    pub ota_id: u16,
    /// Silence after which a bUE is counted as having missed one ping.
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
    #[serde(default = "default_max_missed")]
    pub max_missed_pings: u32,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

fn default_liveness_timeout() -> u64 {
    15
}

fn default_max_missed() -> u32 {
    3
}

fn default_poll_ms() -> u64 {
    50
}

impl BaseConfig {
    pub fn from_yaml(txt: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(txt)?)
    }

    pub async fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        if !Path::new(&path).exists() {
            return Err(ConfigError::NotFound(path));
        }
        let txt = tokio::fs::read_to_string(&path).await?;
        Self::from_yaml(&txt)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }
}
