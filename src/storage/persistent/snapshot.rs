//! Point-in-time image of every stored entity.
//!
//! Compaction writes the whole index into `entities.snapshot` and then empties the
//! write-ahead log. The file is written beside its final name and renamed into
//! place, so a crash leaves either the old snapshot or the new one.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [codec frame of SnapshotData]
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::EntityDocument;

use super::codec;

/// Snapshot file name inside the data directory.
pub const SNAPSHOT_FILE: &str = "entities.snapshot";

const TEMP_SUFFIX: &str = "tmp";

/// Contents of a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotData {
    /// Last log sequence folded into this image.
    pub sequence: u64,
    /// When the snapshot was taken.
    pub created_at: Option<DateTime<Utc>>,
    /// Every stored entity, in store order.
    pub documents: Vec<EntityDocument>,
}

/// Snapshot file for one data directory.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(SNAPSHOT_FILE),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot, or `None` when none has been written yet.
    pub fn load(&self) -> IoResult<Option<SnapshotData>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut reader = BufReader::new(File::open(&self.path)?);
        codec::read_header(&mut reader)?;
        codec::decode(&mut reader).map(Some)
    }

    /// Atomically replaces the snapshot with `data`.
    pub fn write(&self, data: &SnapshotData) -> IoResult<()> {
        let temp = self.path.with_extension(TEMP_SUFFIX);
        let result = Self::write_to(&temp, data).and_then(|()| fs::rename(&temp, &self.path));
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result?;

        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }
        Ok(())
    }

    fn write_to(path: &Path, data: &SnapshotData) -> IoResult<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;
        writer.write_all(&codec::encode(data)?)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> IoResult<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> IoResult<()> {
    Ok(())
}
