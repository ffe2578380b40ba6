//! Persistent storage backend.
//!
//! Durable, crash-safe storage built from:
//! - a write-ahead log replayed on open
//! - an exclusive directory lock against concurrent processes
//! - CRC32 framing for corruption detection
//! - periodic snapshots that keep the log short
//!
//! # Layout
//!
//! ```text
//! <data_dir>/
//! ├── .lock               exclusive flock held while open
//! ├── entities.snapshot   last compacted image (optional)
//! └── entities.wal        mutations since that image
//! ```

mod codec;
mod file_lock;
mod snapshot;
mod store;
mod wal;

pub use file_lock::DirectoryLock;
pub use snapshot::{SnapshotData, SnapshotFile, SNAPSHOT_FILE};
pub use store::{CompactionResult, PersistentEntityStore, WAL_FILE};
pub use wal::{WalEntry, WalRecord, WriteAheadLog};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::error::RegistryError;

/// Tuning for the persistent backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// Whether to fsync after every log append (slower but safer).
    pub sync_on_write: bool,
    /// Log size in bytes that triggers compaction.
    pub max_wal_size: u64,
    /// Whether to compact right after replaying a non-empty log.
    pub compact_on_open: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_wal_size: 64 * 1024 * 1024,
            compact_on_open: false,
        }
    }
}

impl PersistentConfig {
    /// Smallest accepted `max_wal_size`; anything lower compacts on nearly every write.
    pub const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// # Errors
    /// Returns `ConfigError::InvalidValue` if `max_wal_size` is below
    /// [`Self::MIN_WAL_SIZE`].
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "max_wal_size".to_string(),
                reason: format!(
                    "must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            });
        }
        Ok(self)
    }
}

/// Open or create a persistent registry store at `path`.
///
/// # Errors
/// - `Config` if the configuration is invalid
/// - `Storage` if the directory cannot be created or locked, or replay fails
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use entities_registry::storage::persistent::open_database;
///
/// let store = Arc::new(open_database("./registry-data", None)?);
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<PersistentEntityStore, RegistryError> {
    let config = config.unwrap_or_default().validate()?;
    Ok(PersistentEntityStore::open(path.as_ref(), config)?)
}
