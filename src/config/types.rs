//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Checkpoint store settings.
    pub positions: PositionsConfig,
    /// Line source settings.
    pub tail: TailSettings,
}

impl Config {
    /// Reject settings that cannot drive a tail session.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for zero-length periods.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.positions.sync_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "positions.sync_period_ms must be greater than zero".to_string(),
            ));
        }
        if self.tail.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "tail.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where and how often read offsets are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionsConfig {
    /// Positions file location.
    pub filename: PathBuf,
    /// Checkpoint and flush interval in milliseconds.
    pub sync_period_ms: u64,
    /// Start from an empty store instead of failing on a corrupted file.
    pub ignore_invalid: bool,
}

impl PositionsConfig {
    /// Checkpoint interval as a `Duration`.
    #[must_use]
    pub fn sync_period(&self) -> Duration {
        Duration::from_millis(self.sync_period_ms)
    }
}

fn default_positions_filename() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("log-tailer")
        .join("positions.json")
}

impl Default for PositionsConfig {
    fn default() -> Self {
        Self {
            filename: default_positions_filename(),
            sync_period_ms: 10_000,
            ignore_invalid: false,
        }
    }
}

/// Settings for the underlying file follower.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TailSettings {
    /// Fallback polling interval when no file system event arrives.
    pub poll_interval_ms: u64,
}

impl TailSettings {
    /// Polling interval as a `Duration`.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for TailSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
        }
    }
}
