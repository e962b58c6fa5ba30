//! Write-ahead journal of committed batches.
//!
//! Each committed [`WriteBatch`] becomes exactly one framed [`WalEntry`], written
//! and flushed before the batch is applied in memory. On open the journal is
//! replayed; a torn or corrupted tail is cut off so later appends start from the
//! last intact record. A transaction is therefore either fully recovered or
//! absent.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::memory::Journal;
use crate::storage::traits::{StorageError, WriteBatch};

use super::codec;

/// A single journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Store commit sequence number of this batch.
    pub sequence: u64,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
    /// The committed batch.
    pub batch: WriteBatch,
}

/// Outcome of reading a journal from disk.
#[derive(Debug, Default)]
pub struct Recovery {
    /// Intact entries in order.
    pub entries: Vec<WalEntry>,
    /// Bytes cut from a torn or corrupted tail.
    pub discarded_bytes: u64,
}

struct Tail {
    file: File,
    len: u64,
}

/// Append-only journal file.
pub struct WriteAheadLog {
    path: PathBuf,
    tail: Mutex<Tail>,
    sync_on_write: bool,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

impl WriteAheadLog {
    /// Opens (creating if needed) the journal and returns its intact entries.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<(Self, Recovery)> {
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let recovery = if exists && file.metadata()?.len() >= codec::HEADER_LEN {
            let (recovery, valid_len) = Self::read_entries(path)?;
            if recovery.discarded_bytes > 0 {
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            recovery
        } else {
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            Recovery::default()
        };

        let file = OpenOptions::new().append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok((
            Self {
                path: path.to_path_buf(),
                tail: Mutex::new(Tail { file, len }),
                sync_on_write,
            },
            recovery,
        ))
    }

    fn read_entries(path: &Path) -> IoResult<(Recovery, u64)> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;

        let mut recovery = Recovery::default();
        let mut valid_len = reader.stream_position()?;
        while valid_len < file_size {
            match codec::decode::<WalEntry>(&mut reader) {
                Ok(entry) => {
                    recovery.entries.push(entry);
                    valid_len = reader.stream_position()?;
                }
                Err(e) => {
                    if e.kind() != ErrorKind::UnexpectedEof {
                        tracing::warn!(
                            path = %path.display(),
                            after_sequence = recovery.entries.last().map_or(0, |e| e.sequence),
                            error = %e,
                            "journal corruption detected; truncating tail"
                        );
                    }
                    break;
                }
            }
        }
        recovery.discarded_bytes = file_size - valid_len;
        Ok((recovery, valid_len))
    }

    /// Appends one entry (fsyncing if configured).
    ///
    /// A failed append cuts the file back to its previous length so a partial
    /// frame never sits in front of later records.
    pub fn append(&self, entry: &WalEntry) -> IoResult<()> {
        let encoded = codec::encode(entry)?;
        let mut tail = self
            .tail
            .lock()
            .map_err(|_| std::io::Error::new(ErrorKind::Other, "journal writer lock poisoned"))?;

        let written = tail.file.write_all(&encoded).and_then(|()| {
            if self.sync_on_write {
                tail.file.sync_data()
            } else {
                Ok(())
            }
        });
        match written {
            Ok(()) => {
                tail.len += encoded.len() as u64;
                Ok(())
            }
            Err(err) => {
                let len = tail.len;
                if let Err(undo) = tail.file.set_len(len) {
                    tracing::warn!(path = %self.path.display(), error = %undo, "could not undo partial journal append");
                }
                Err(err)
            }
        }
    }

    /// Journal size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.tail.lock().map_or(0, |t| t.len)
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for WriteAheadLog {
    fn append(&self, sequence: u64, batch: &WriteBatch) -> Result<(), StorageError> {
        let entry = WalEntry {
            sequence,
            timestamp: Utc::now(),
            batch: batch.clone(),
        };
        WriteAheadLog::append(self, &entry)
            .map_err(|e| StorageError::BackendError(format!("journal append failed: {e}")))
    }
}

/// Shared handle so the store and its owner can both reach the journal.
impl Journal for std::sync::Arc<WriteAheadLog> {
    fn append(&self, sequence: u64, batch: &WriteBatch) -> Result<(), StorageError> {
        Journal::append(self.as_ref(), sequence, batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::Branch;
    use crate::storage::traits::WriteOp;
    use tempfile::tempdir;

    fn entry(sequence: u64) -> WalEntry {
        WalEntry {
            sequence,
            timestamp: Utc::now(),
            batch: WriteBatch {
                ops: vec![WriteOp::PutBranch(Branch::child(format!("b{sequence}"), "main"))],
                guards: Vec::new(),
            },
        }
    }

    #[test]
    fn test_wal_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kyromem.wal");

        {
            let (wal, recovery) = WriteAheadLog::open(&path, false).unwrap();
            assert!(recovery.entries.is_empty());
            wal.append(&entry(1)).unwrap();
            wal.append(&entry(2)).unwrap();
        }

        let (_wal, recovery) = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(recovery.entries.len(), 2);
        assert_eq!(recovery.entries[1].sequence, 2);
        assert_eq!(recovery.discarded_bytes, 0);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kyromem.wal");

        {
            let (wal, _) = WriteAheadLog::open(&path, true).unwrap();
            wal.append(&entry(1)).unwrap();
            wal.append(&entry(2)).unwrap();
        }
        let full = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(full - 4).unwrap();

        let (wal, recovery) = WriteAheadLog::open(&path, true).unwrap();
        assert_eq!(recovery.entries.len(), 1);
        assert!(recovery.discarded_bytes > 0);

        // Appends after recovery stay readable.
        wal.append(&entry(2)).unwrap();
        drop(wal);
        let (_wal, recovery) = WriteAheadLog::open(&path, true).unwrap();
        assert_eq!(recovery.entries.len(), 2);
    }
}
