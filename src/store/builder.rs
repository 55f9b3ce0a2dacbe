use std::path::Path;

use serde::{Deserialize, Serialize};

use super::database::Store;
use super::paths::StorePaths;
use super::transaction::Durability;
use super::wal::WALConfig;
use crate::error::Result;

/// Settings fixed for the lifetime of an open [`Store`].
///
/// Serializable so hosts can keep it alongside the rest of their
/// configuration. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Background checkpoint triggers.
    pub checkpoint: WALConfig,

    /// Contexts that may hold a registered connection at once. The least
    /// recently used one is forgotten when the limit is reached. Zero turns
    /// registration off.
    ///
    /// Default: 64
    pub max_connections: usize,

    /// Durability of write transactions unless changed per transaction.
    ///
    /// Default: [`Durability::Immediate`]
    pub default_durability: Durability,

    /// Run the background checkpoint thread. When off, checkpoints only
    /// happen on [`Store::checkpoint`] and on close.
    ///
    /// Default: true
    pub background_checkpoint: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            checkpoint: WALConfig::default(),
            max_connections: 64,
            default_durability: Durability::Immediate,
            background_checkpoint: true,
        }
    }
}

/// Configures and opens a [`Store`].
///
/// ```no_run
/// use std::time::Duration;
/// use session_store::{Durability, Store, WALConfig};
///
/// let store = Store::builder()
///     .checkpoint(WALConfig {
///         checkpoint_interval: Duration::from_secs(10),
///         max_wal_size: 1024 * 1024,
///     })
///     .default_durability(Durability::Deferred)
///     .open("signal.db")?;
/// # Ok::<(), session_store::StoreError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct StoreBuilder {
    config: StoreConfig,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn checkpoint(mut self, checkpoint: WALConfig) -> Self {
        self.config.checkpoint = checkpoint;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.config.max_connections = max_connections;
        self
    }

    pub fn default_durability(mut self, durability: Durability) -> Self {
        self.config.default_durability = durability;
        self
    }

    /// Disables the background checkpoint thread.
    pub fn without_background_checkpoint(mut self) -> Self {
        self.config.background_checkpoint = false;
        self
    }

    /// Opens the store at `path`, creating its files if absent and recovering
    /// any committed transactions left in the log.
    pub fn open(self, path: impl AsRef<Path>) -> Result<Store> {
        Store::open_with_config(StorePaths::new(path), self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_builder_setters() {
        let builder = StoreBuilder::new()
            .max_connections(4)
            .default_durability(Durability::Deferred)
            .without_background_checkpoint()
            .checkpoint(WALConfig {
                checkpoint_interval: Duration::from_secs(1),
                max_wal_size: 4096,
            });

        let config = builder.config;
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.default_durability, Durability::Deferred);
        assert!(!config.background_checkpoint);
        assert_eq!(config.checkpoint.max_wal_size, 4096);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"max_connections": 8, "default_durability": "deferred"}"#)
                .unwrap();
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.default_durability, Durability::Deferred);
        assert!(config.background_checkpoint);
        assert_eq!(config.checkpoint, WALConfig::default());

        let json = serde_json::to_string(&config).unwrap();
        let back: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
