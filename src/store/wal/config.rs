use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the Write-Ahead Log system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WALConfig {
    /// How often to checkpoint the WAL into the primary file.
    ///
    /// Default: 30 seconds
    pub checkpoint_interval: Duration,

    /// Size of the WAL file that triggers a checkpoint regardless of the interval.
    ///
    /// Default: 4 MB
    pub max_wal_size: u64,
}

impl Default for WALConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(30),
            max_wal_size: 4 * 1024 * 1024,
        }
    }
}

/// Trigger settings handed to the background checkpoint thread.
#[derive(Debug, Clone)]
pub(crate) struct CheckpointConfig {
    /// Time-based checkpoint trigger.
    pub(crate) interval: Duration,

    /// Size-based checkpoint trigger.
    pub(crate) max_wal_size: u64,
}

impl From<WALConfig> for CheckpointConfig {
    fn from(config: WALConfig) -> Self {
        Self {
            interval: config.checkpoint_interval,
            max_wal_size: config.max_wal_size,
        }
    }
}
