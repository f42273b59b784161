use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetrySettings;

/// Top-level configuration loaded from tether.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TetherConfig {
    pub worker: WorkerConfig,
    pub watcher: WatcherConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker command to supervise. Required; there is no sensible default
    /// worker, so an empty command fails validation at startup.
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Consecutive failed launches tolerated per sequence before giving up.
    pub max_launch_attempts: u32,
    /// Backoff after the first failed launch.
    pub initial_backoff_ms: u64,
    /// Cap on the doubling backoff.
    pub max_backoff_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            max_launch_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 4000,
        }
    }
}

impl WatcherConfig {
    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            max_attempts: self.max_launch_attempts,
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Errors loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load configuration. A missing file yields defaults so the CLI can run
/// from arguments alone.
pub fn load(path: &Path) -> Result<TetherConfig, ConfigError> {
    if !path.exists() {
        return Ok(TetherConfig::default());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
