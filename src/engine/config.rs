//! Node Configuration Module
//! Handles loading and validating config.json from the device root

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::updater::download::RetryPolicy;

pub const CONFIG_FILE: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Failed to write config: {0}")]
    WriteError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub ota: OtaConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_file_retries")]
    pub max_file_retries: u32,
    #[serde(default = "default_max_chunk_retries")]
    pub max_chunk_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Delay between answering a request and resetting the device
    #[serde(default = "default_reset_delay_ms")]
    pub reset_delay_ms: u64,
}

fn default_base_url() -> String {
    "https://raw.githubusercontent.com/snuarrow/LaiskaJaakko/production/pico-sensor/".to_string()
}

fn default_max_file_retries() -> u32 {
    5
}

fn default_max_chunk_retries() -> u32 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    3000
}

fn default_chunk_size() -> usize {
    1024
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_max_header_bytes() -> usize {
    8 * 1024
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    80
}

fn default_reset_delay_ms() -> u64 {
    1000
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            max_file_retries: default_max_file_retries(),
            max_chunk_retries: default_max_chunk_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            chunk_size: default_chunk_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            reset_delay_ms: default_reset_delay_ms(),
        }
    }
}

impl OtaConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_file_retries: self.max_file_retries,
            max_chunk_retries: self.max_chunk_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl ApiConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }
}

impl NodeConfig {
    /// Load `config.json` from the device root; a missing file yields defaults
    pub fn load(device_root: &Path) -> Result<Self, ConfigError> {
        let config_path = device_root.join(CONFIG_FILE);
        let content = match std::fs::read_to_string(&config_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No {} in {}, using defaults", CONFIG_FILE, device_root.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::ReadError {
                    path: config_path,
                    source,
                })
            }
        };
        let config: NodeConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, device_root: &Path) -> Result<(), ConfigError> {
        let config_path = device_root.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }
}
