//! Write-ahead log of entity mutations.
//!
//! Every mutation is appended (and optionally fsynced) before it is applied to
//! the in-memory index. On open the log is replayed. A frame cut short by a crash
//! marks the end of the valid log; it is truncated away so later appends stay
//! readable.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec frame of WalEntry]
//! [ENTRY 2: codec frame of WalEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::document::EntityDocument;
use crate::uri::EntityUri;

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The logged mutation.
    pub record: WalRecord,
}

/// A logged mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord {
    /// New entities, in request order.
    Create(Vec<EntityDocument>),
    /// Top-level fields merged over an existing entity.
    Update { uri: EntityUri, patch: EntityDocument },
    /// Removed entities (only those that were present).
    Delete { uris: Vec<EntityUri> },
}

struct WalWriter {
    writer: BufWriter<File>,
    sequence: u64,
}

/// Append-only mutation log.
///
/// Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    sync_on_write: bool,
}

fn poisoned() -> IoError {
    IoError::other("poisoned lock: wal.writer")
}

impl WriteAheadLog {
    /// Opens or creates the log and returns it with every valid entry.
    ///
    /// `base_sequence` is the sequence already covered by a snapshot; numbering
    /// continues from whichever is higher, it or the last logged entry.
    pub fn open(
        path: &Path,
        sync_on_write: bool,
        base_sequence: u64,
    ) -> IoResult<(Self, Vec<WalEntry>)> {
        let has_header = path.exists() && std::fs::metadata(path)?.len() >= codec::HEADER_LEN;

        let entries = if has_header {
            let (entries, valid_len) = Self::scan(path)?;
            let file = OpenOptions::new().write(true).open(path)?;
            if file.metadata()?.len() > valid_len {
                warn!(
                    path = %path.display(),
                    valid_len,
                    "discarding torn tail of write-ahead log"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            entries
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
            Vec::new()
        };

        let sequence = entries
            .last()
            .map_or(base_sequence, |e| e.sequence.max(base_sequence));
        let file = OpenOptions::new().append(true).open(path)?;

        let wal = Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                writer: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        };
        Ok((wal, entries))
    }

    /// Reads entries up to the first frame that is torn or corrupt.
    ///
    /// Returns the entries and the byte length of the valid prefix.
    fn scan(path: &Path) -> IoResult<(Vec<WalEntry>, u64)> {
        let mut reader = BufReader::new(File::open(path)?);
        codec::read_header(&mut reader)?;

        let mut entries = Vec::new();
        let mut valid_len = codec::HEADER_LEN;
        loop {
            match codec::decode::<WalEntry>(&mut reader) {
                Ok(entry) => {
                    valid_len = reader.stream_position()?;
                    entries.push(entry);
                }
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        after_sequence = entries.last().map_or(0, |e: &WalEntry| e.sequence),
                        error = %e,
                        "write-ahead log corruption detected; replaying up to the valid point"
                    );
                    break;
                }
            }
        }
        Ok((entries, valid_len))
    }

    /// Appends a record and returns the sequence number assigned to it.
    pub fn append(&self, record: WalRecord) -> IoResult<u64> {
        let mut guard = self.writer.lock().map_err(|_| poisoned())?;

        let sequence = guard.sequence + 1;
        let encoded = codec::encode(&WalEntry {
            sequence,
            timestamp: Utc::now(),
            record,
        })?;

        guard.writer.write_all(&encoded)?;
        guard.writer.flush()?;
        if self.sync_on_write {
            guard.writer.get_ref().sync_all()?;
        }

        guard.sequence = sequence;
        Ok(sequence)
    }

    /// The sequence number of the last appended entry.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.writer.lock().map_err(|_| poisoned())?.sequence)
    }

    /// The log file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Drops every entry, keeping the header and the sequence counter.
    ///
    /// Only call this once a snapshot covering the current sequence is durable.
    pub fn truncate(&self) -> IoResult<()> {
        let mut guard = self.writer.lock().map_err(|_| poisoned())?;
        guard.writer.flush()?;

        let mut file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        codec::write_header(&mut file)?;
        file.sync_all()?;

        guard.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        Ok(())
    }
}
