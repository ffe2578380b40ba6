//! File-backed [`EntityStore`].
//!
//! State lives in memory in the same index the in-memory backend uses. Every
//! mutation is logged before it is applied, and opening a directory rebuilds the
//! index from the last snapshot plus the log entries written after it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockWriteGuard};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::document::EntityDocument;
use crate::search::{RawQuery, SearchQuery};
use crate::storage::memory::EntityIndex;
use crate::storage::traits::{
    check_update_identity, Created, DocumentStream, EntityStore, StorageError,
};
use crate::uri::EntityUri;

use super::codec;
use super::file_lock::DirectoryLock;
use super::snapshot::{SnapshotData, SnapshotFile};
use super::wal::{WalRecord, WriteAheadLog};
use super::PersistentConfig;

/// Log file name inside the data directory.
pub const WAL_FILE: &str = "entities.wal";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Poisoned(context)
}

struct Inner {
    index: EntityIndex,
    wal: WriteAheadLog,
}

/// Outcome of [`PersistentEntityStore::compact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    /// False when the log was already empty and nothing was written.
    pub snapshot_written: bool,
    /// Entities in the snapshot.
    pub entities: usize,
    /// Last log sequence covered by the snapshot.
    pub sequence: u64,
    /// Log size before compaction.
    pub wal_size_before: u64,
    /// Log size after compaction.
    pub wal_size_after: u64,
}

/// Durable entity store rooted at a data directory.
pub struct PersistentEntityStore {
    dir: PathBuf,
    config: PersistentConfig,
    snapshot: SnapshotFile,
    state: RwLock<Inner>,
    // Declared last so the log is closed before the directory is released.
    _lock: DirectoryLock,
}

impl std::fmt::Debug for PersistentEntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentEntityStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistentEntityStore {
    /// Opens or creates a store in `dir`.
    ///
    /// # Errors
    /// - `Io` with `ErrorKind::WouldBlock` if another process holds the directory
    /// - `Io` if the snapshot is unreadable
    /// - the error a replayed log entry fails with
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let lock = DirectoryLock::acquire(dir)?;

        let snapshot = SnapshotFile::new(dir);
        let base = snapshot.load()?.unwrap_or_default();
        let base_sequence = base.sequence;

        let mut index = EntityIndex::default();
        let uris = index.prepare_create(&base.documents)?;
        index.insert_all(uris, base.documents);

        let (wal, entries) =
            WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write, base_sequence)?;

        let mut replayed = 0usize;
        for entry in entries {
            if entry.sequence <= base_sequence {
                continue;
            }
            apply_record(&mut index, entry.record).map_err(|e| {
                StorageError::BackendError(format!(
                    "failed to replay log entry {}: {e}",
                    entry.sequence
                ))
            })?;
            replayed += 1;
        }

        info!(
            dir = %dir.display(),
            entities = index.len(),
            snapshot_sequence = base_sequence,
            replayed,
            "opened persistent entity store"
        );

        let store = Self {
            dir: dir.to_path_buf(),
            config,
            snapshot,
            state: RwLock::new(Inner { index, wal }),
            _lock: lock,
        };

        if store.config.compact_on_open && replayed > 0 {
            store.compact()?;
        }
        Ok(store)
    }

    /// The data directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of stored entities.
    ///
    /// # Errors
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.state.read().map_err(|_| lock_err("entity.len"))?.index.len())
    }

    /// Returns true if nothing is stored.
    ///
    /// # Errors
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Current log size in bytes.
    ///
    /// # Errors
    /// Returns an error if the lock is poisoned or the file cannot be inspected.
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.wal_size"))?;
        Ok(state.wal.size_bytes()?)
    }

    /// Folds the log into a fresh snapshot and empties it.
    ///
    /// If this fails partway the log still holds every mutation and is replayed on
    /// the next open.
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be written or the log truncated.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let state = self.state.write().map_err(|_| lock_err("entity.compact"))?;
        self.compact_locked(&state)
    }

    fn compact_locked(&self, state: &Inner) -> Result<CompactionResult, StorageError> {
        let wal_size_before = state.wal.size_bytes()?;
        let sequence = state.wal.current_sequence()?;

        if wal_size_before <= codec::HEADER_LEN {
            return Ok(CompactionResult {
                snapshot_written: false,
                entities: state.index.len(),
                sequence,
                wal_size_before,
                wal_size_after: wal_size_before,
            });
        }

        let data = SnapshotData {
            sequence,
            created_at: Some(Utc::now()),
            documents: state.index.documents().cloned().collect(),
        };
        self.snapshot.write(&data)?;
        state.wal.truncate()?;

        let wal_size_after = state.wal.size_bytes()?;
        info!(
            dir = %self.dir.display(),
            entities = data.documents.len(),
            sequence,
            wal_size_before,
            wal_size_after,
            "compacted write-ahead log into snapshot"
        );

        Ok(CompactionResult {
            snapshot_written: true,
            entities: data.documents.len(),
            sequence,
            wal_size_before,
            wal_size_after,
        })
    }

    /// Compacts once the log outgrows its limit.
    ///
    /// The triggering write is already durable, so a failure here is logged and
    /// left for the next write or open to retry.
    fn maybe_compact(&self, state: &RwLockWriteGuard<'_, Inner>) {
        let size = match state.wal.size_bytes() {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "could not inspect write-ahead log size");
                return;
            }
        };
        if size <= self.config.max_wal_size {
            return;
        }

        debug!(size, limit = self.config.max_wal_size, "write-ahead log over limit");
        if let Err(e) = self.compact_locked(state) {
            warn!(error = %e, "automatic compaction failed");
        }
    }
}

fn apply_record(index: &mut EntityIndex, record: WalRecord) -> Result<(), StorageError> {
    match record {
        WalRecord::Create(documents) => {
            let uris = index.prepare_create(&documents)?;
            index.insert_all(uris, documents);
        }
        WalRecord::Update { uri, patch } => {
            index.apply_update(&uri, &patch);
        }
        WalRecord::Delete { uris } => {
            index.remove_all(&uris);
        }
    }
    Ok(())
}

impl EntityStore for PersistentEntityStore {
    fn backend_name(&self) -> &'static str {
        "persistent"
    }

    fn contains(&self, uri: &EntityUri) -> Result<bool, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.contains"))?;
        Ok(state.index.contains(uri))
    }

    fn read(&self, uri: &EntityUri) -> Result<Option<EntityDocument>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.read"))?;
        Ok(state.index.get(uri).cloned())
    }

    fn create(&self, documents: Vec<EntityDocument>) -> Result<Created, StorageError> {
        if documents.is_empty() {
            return Ok(Created::Nothing);
        }

        let mut state = self.state.write().map_err(|_| lock_err("entity.create"))?;
        let uris = state.index.prepare_create(&documents)?;
        state.wal.append(WalRecord::Create(documents.clone()))?;
        state.index.insert_all(uris, documents.clone());

        self.maybe_compact(&state);
        Ok(Created::from_batch(documents))
    }

    fn update(&self, uri: &EntityUri, document: EntityDocument) -> Result<(), StorageError> {
        check_update_identity(uri, &document)?;

        let mut state = self.state.write().map_err(|_| lock_err("entity.update"))?;
        if !state.index.contains(uri) {
            return Ok(());
        }

        state.wal.append(WalRecord::Update {
            uri: uri.clone(),
            patch: document.clone(),
        })?;
        state.index.apply_update(uri, &document);

        self.maybe_compact(&state);
        Ok(())
    }

    fn delete(&self, uris: &[EntityUri]) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("entity.delete"))?;

        let mut seen = HashSet::new();
        let present: Vec<EntityUri> = uris
            .iter()
            .filter(|uri| state.index.contains(uri) && seen.insert(*uri))
            .cloned()
            .collect();
        if present.is_empty() {
            return Ok(());
        }

        state.wal.append(WalRecord::Delete {
            uris: present.clone(),
        })?;
        state.index.remove_all(&present);

        self.maybe_compact(&state);
        Ok(())
    }

    fn search(&self, query: &SearchQuery) -> Result<DocumentStream<'_>, StorageError> {
        let snapshot = self
            .state
            .read()
            .map_err(|_| lock_err("entity.search"))?
            .index
            .snapshot();
        Ok(Box::new(snapshot.search(query)?))
    }

    fn count(&self, raw: Option<&RawQuery>) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.count"))?;
        Ok(state.index.snapshot().count(raw))
    }
}
