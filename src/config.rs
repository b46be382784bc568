use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Tunables for a sync session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Fallback reachability poll for platforms with unreliable events.
    pub poll_interval_ms: u64,
    /// Upper bound for a single collection read.
    pub fetch_timeout_ms: u64,
    /// Upper bound for the background refetch at session start.
    pub bootstrap_timeout_ms: u64,
    /// Upper bound for a direct remote write before it is queued instead.
    pub write_timeout_ms: u64,
    /// Capacity of the sync event bus.
    pub event_capacity: usize,
    /// SQLite file backing the queue and caches. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            fetch_timeout_ms: 3_000,
            bootstrap_timeout_ms: 1_500,
            write_timeout_ms: 5_000,
            event_capacity: 64,
            database_path: None,
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: SyncConfig =
            toml::from_str(raw).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(SyncError::Config("poll_interval_ms must be positive".into()));
        }
        if self.fetch_timeout_ms == 0
            || self.write_timeout_ms == 0
            || self.bootstrap_timeout_ms == 0
        {
            return Err(SyncError::Config("timeouts must be positive".into()));
        }
        if self.bootstrap_timeout_ms > self.fetch_timeout_ms {
            return Err(SyncError::Config(
                "bootstrap_timeout_ms cannot exceed fetch_timeout_ms".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::Config("event_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
