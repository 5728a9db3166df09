//! Runtime configuration
//!
//! Stored as pretty JSON. Missing fields fall back to their defaults, so a
//! config file only needs to name what it changes.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Synchronization engine limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum events per push or pull request.
    pub batch_size: u64,
    /// Rounds a single backfill may run before giving up on convergence.
    pub max_rounds: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_rounds: 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Capacity of the ingest notification channel. Slow subscribers that
    /// fall further behind reload from the store.
    pub notification_capacity: usize,
    /// Cells loaded by `advance` when the caller passes zero.
    pub default_page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            notification_capacity: 1024,
            default_page_size: 10,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub sync: SyncConfig,
    pub query: QueryConfig,
    /// Servers tried for every system in addition to its own server list.
    pub default_servers: Vec<String>,
}

impl CoreConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        serde_json::from_slice(&data).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ConfigError::IoError(e.to_string()))
    }
}
