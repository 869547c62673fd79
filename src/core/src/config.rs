use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Cap on concurrent in-flight declared-tar bytes during layer download.
/// The decompressed footprint can be several times larger.
pub const DEFAULT_THROTTLE_VOLUME: i64 = 400 * 1024 * 1024;

/// Attempts per layer before a download is reported as failed.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Per-request read timeout against a registry.
pub const DEFAULT_DATA_TIMEOUT_SECS: u64 = 600;

/// Files larger than this are never harvested or buffered in memory.
pub const DEFAULT_MAX_FILE_SIZE: i64 = 300 * 1024 * 1024;

/// Runtime socket used when the repository string carries none.
pub const DEFAULT_RT_SOCK: &str = "unix:///var/run/docker.sock";

/// Scan pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Concurrent download budget in declared-tar bytes
    #[serde(default = "default_throttle_volume")]
    pub throttle_volume: i64,

    /// Attempts per layer fetch
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Registry read timeout in seconds
    #[serde(default = "default_data_timeout_secs")]
    pub data_timeout_secs: u64,

    /// Upper bound on individual harvested file size in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: i64,

    /// Default local container runtime socket
    #[serde(default = "default_rt_sock")]
    pub rt_sock: String,
}

fn default_throttle_volume() -> i64 {
    DEFAULT_THROTTLE_VOLUME
}

fn default_retry_limit() -> u32 {
    DEFAULT_RETRY_LIMIT
}

fn default_data_timeout_secs() -> u64 {
    DEFAULT_DATA_TIMEOUT_SECS
}

fn default_max_file_size() -> i64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_rt_sock() -> String {
    DEFAULT_RT_SOCK.to_string()
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            throttle_volume: DEFAULT_THROTTLE_VOLUME,
            retry_limit: DEFAULT_RETRY_LIMIT,
            data_timeout_secs: DEFAULT_DATA_TIMEOUT_SECS,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            rt_sock: DEFAULT_RT_SOCK.to_string(),
        }
    }
}

impl ScanConfig {
    /// Registry read timeout as a `Duration`.
    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_secs)
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}
