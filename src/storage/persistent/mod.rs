//! Durable storage backend (feature `persistent`).
//!
//! [`PersistentStore`] is the in-memory store with a write-ahead journal bolted
//! on: every commit is validated, appended to the journal as one record, then
//! applied. Opening a directory replays the journal into fresh state.
//!
//! ```text
//! <dir>/
//!   kyromem.lock   exclusive process lock
//!   kyromem.wal    header + one record per committed transaction
//! ```

mod codec;
mod file_lock;
mod wal;

pub use file_lock::FileLock;
pub use wal::{Recovery, WalEntry, WriteAheadLog};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::branch::Branch;
use crate::entity::{Entity, EntityId};
use crate::error::{KyroMemResult, ValidationError};
use crate::merge::{MergeRecord, MergeRecordId};
use crate::snapshot::{Snapshot, SnapshotId};
use crate::storage::memory::{InMemoryStore, StoreState};
use crate::storage::traits::{CommitReceipt, EntityFilter, Store, StorageError, WriteBatch};

/// Configuration for the durable backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// fsync after every commit (slower but survives power loss).
    pub sync_on_write: bool,
    /// Journal file name inside the store directory.
    pub wal_file: String,
    /// Create the directory when it does not exist.
    pub create_if_missing: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            wal_file: "kyromem.wal".to_string(),
            create_if_missing: true,
        }
    }
}

impl PersistentConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` when `wal_file` is empty or is
    /// not a bare file name.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.wal_file.is_empty() {
            return Err(ValidationError::InvalidConfig {
                reason: "wal_file must not be empty".to_string(),
            });
        }
        if self.wal_file.contains(['/', '\\']) || self.wal_file == "." || self.wal_file == ".." {
            return Err(ValidationError::InvalidConfig {
                reason: format!("wal_file must be a bare file name (got {:?})", self.wal_file),
            });
        }
        if self.wal_file == file_lock::LOCK_FILE {
            return Err(ValidationError::InvalidConfig {
                reason: format!("wal_file may not be named {}", file_lock::LOCK_FILE),
            });
        }
        Ok(self)
    }
}

/// In-memory state backed by an on-disk journal.
pub struct PersistentStore {
    inner: InMemoryStore,
    wal: Arc<WriteAheadLog>,
    dir: PathBuf,
    _lock: FileLock,
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore")
            .field("dir", &self.dir)
            .field("wal", &self.wal)
            .finish_non_exhaustive()
    }
}

fn io_err(context: &str, err: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {err}"))
}

impl PersistentStore {
    /// Opens (or creates) a store in `dir` and replays its journal.
    ///
    /// # Errors
    ///
    /// - `StorageError::BackendError` if the directory is unusable, another
    ///   process holds the lock, or the journal header is invalid
    /// - `StorageError::SerializationError` if a recovered batch no longer
    ///   applies cleanly
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        if !dir.exists() {
            if !config.create_if_missing {
                return Err(StorageError::BackendError(format!(
                    "store directory {} does not exist",
                    dir.display()
                )));
            }
            std::fs::create_dir_all(dir).map_err(|e| io_err("create store directory", &e))?;
        }

        let lock = FileLock::acquire(dir).map_err(|e| io_err("lock store directory", &e))?;
        let (wal, recovery) = WriteAheadLog::open(&dir.join(&config.wal_file), config.sync_on_write)
            .map_err(|e| io_err("open journal", &e))?;

        let state = replay(recovery.entries)?;
        tracing::info!(
            dir = %dir.display(),
            sequence = state.sequence(),
            discarded_bytes = recovery.discarded_bytes,
            "opened persistent store"
        );

        let wal = Arc::new(wal);
        Ok(Self {
            inner: InMemoryStore::with_journal(state, Box::new(Arc::clone(&wal))),
            wal,
            dir: dir.to_path_buf(),
            _lock: lock,
        })
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current journal size in bytes.
    #[must_use]
    pub fn journal_size_bytes(&self) -> u64 {
        self.wal.size_bytes()
    }
}

fn replay(entries: Vec<WalEntry>) -> Result<StoreState, StorageError> {
    let mut state = StoreState::default();
    for entry in entries {
        if entry.sequence != state.sequence() + 1 {
            tracing::warn!(
                expected = state.sequence() + 1,
                found = entry.sequence,
                "journal sequence gap"
            );
        }
        state.check(&entry.batch).map_err(|e| {
            StorageError::SerializationError(format!(
                "journal record {} does not apply: {e}",
                entry.sequence
            ))
        })?;
        state.apply(entry.batch);
    }
    Ok(state)
}

impl Store for PersistentStore {
    fn get_branch(&self, name: &str) -> Result<Option<Branch>, StorageError> {
        self.inner.get_branch(name)
    }

    fn list_branches(&self) -> Result<Vec<Branch>, StorageError> {
        self.inner.list_branches()
    }

    fn branch_version(&self, name: &str) -> Result<u64, StorageError> {
        self.inner.branch_version(name)
    }

    fn get_entity(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        self.inner.get_entity(id)
    }

    fn scan_branch(&self, branch: &str, filter: &EntityFilter) -> Result<Vec<Entity>, StorageError> {
        self.inner.scan_branch(branch, filter)
    }

    fn conversation_messages(&self, conversation_id: EntityId) -> Result<Vec<Entity>, StorageError> {
        self.inner.conversation_messages(conversation_id)
    }

    fn text_search(&self, branch: &str, query: &str) -> Result<Vec<(EntityId, f32)>, StorageError> {
        self.inner.text_search(branch, query)
    }

    fn get_merge_record(&self, id: MergeRecordId) -> Result<Option<MergeRecord>, StorageError> {
        self.inner.get_merge_record(id)
    }

    fn merge_records(&self, branch: &str) -> Result<Vec<MergeRecord>, StorageError> {
        self.inner.merge_records(branch)
    }

    fn get_snapshot(&self, id: SnapshotId) -> Result<Option<Snapshot>, StorageError> {
        self.inner.get_snapshot(id)
    }

    fn list_snapshots(&self, branch: &str) -> Result<Vec<Snapshot>, StorageError> {
        self.inner.list_snapshots(branch)
    }

    fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StorageError> {
        self.inner.commit(batch)
    }

    fn rebuild_indexes(&self) -> Result<(), StorageError> {
        self.inner.rebuild_indexes()
    }
}

/// Opens or creates a persistent memory store at `path`.
///
/// # Errors
///
/// Fails on invalid configuration, an unusable or locked directory, or a
/// journal that cannot be replayed.
///
/// # Example
/// ```rust,ignore
/// use kyromem::storage::persistent::open_database;
///
/// let store = open_database("./agent.kmem", None)?;
/// let mem = KyroMem::new(Arc::new(store));
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> KyroMemResult<PersistentStore> {
    let config = config.unwrap_or_default().validate()?;
    Ok(PersistentStore::open(path.as_ref(), config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityPayload, Fact};
    use crate::storage::traits::WriteOp;
    use tempfile::tempdir;

    #[test]
    fn config_rejects_paths() {
        let cfg = PersistentConfig {
            wal_file: "../escape.wal".to_string(),
            ..PersistentConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(PersistentConfig::default().validate().is_ok());
    }

    #[test]
    fn reopen_replays_commits() {
        let dir = tempdir().unwrap();
        let fact = Entity::new("main", EntityPayload::Fact(Fact::new("durable", "general", 0.8).unwrap()));
        {
            let store = PersistentStore::open(dir.path(), PersistentConfig::default()).unwrap();
            store
                .commit(WriteBatch {
                    ops: vec![WriteOp::PutBranch(Branch::root()), WriteOp::InsertEntity(fact.clone())],
                    guards: Vec::new(),
                })
                .unwrap();
        }

        let store = PersistentStore::open(dir.path(), PersistentConfig::default()).unwrap();
        assert_eq!(store.get_entity(fact.id).unwrap(), Some(fact));
        assert_eq!(store.text_search("main", "durable").unwrap().len(), 1);
        assert_eq!(store.branch_version("main").unwrap(), 1);
    }

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let _first = PersistentStore::open(dir.path(), PersistentConfig::default()).unwrap();
        let err = PersistentStore::open(dir.path(), PersistentConfig::default()).unwrap_err();
        assert!(matches!(err, StorageError::BackendError(msg) if msg.contains("locked")));
    }

    #[test]
    fn rejected_commit_is_not_journaled() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open(dir.path(), PersistentConfig::default()).unwrap();
        let before = store.journal_size_bytes();
        let orphan = Entity::new("nowhere", EntityPayload::Fact(Fact::new("x", "general", 0.5).unwrap()));
        assert!(store
            .commit(WriteBatch {
                ops: vec![WriteOp::InsertEntity(orphan)],
                guards: Vec::new(),
            })
            .is_err());
        assert_eq!(store.journal_size_bytes(), before);
    }
}
