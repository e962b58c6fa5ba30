//! Abstract storage contract for KyroMem.
//!
//! Reads go straight to the backend. Writes are expressed as a [`WriteBatch`]
//! and applied by [`Store::commit`] all-or-nothing: a backend validates the
//! whole batch before applying any of it, so a failed commit leaves zero rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::branch::{Branch, BranchStatus};
use crate::entity::{Entity, EntityId, EntityKind};
use crate::merge::{MergeRecord, MergeRecordId};
use crate::snapshot::{Snapshot, SnapshotId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A write referenced a branch the registry does not know.
    #[error("Unknown branch: {0}")]
    UnknownBranch(String),

    /// A write targeted a deleted branch.
    #[error("Branch is closed for writes: {0}")]
    BranchClosed(String),

    /// Another commit touched a guarded branch after it was read.
    #[error("Write conflict on branch '{branch}': expected version {expected}, found {actual}")]
    WriteConflict {
        /// Guarded branch.
        branch: String,
        /// Version observed when the guard was taken.
        expected: u64,
        /// Version at commit time.
        actual: u64,
    },

    /// The transaction staged more operations than allowed.
    #[error("Batch too large: {ops} operations (max {max})")]
    BatchTooLarge {
        /// Staged operations.
        ops: usize,
        /// Configured limit.
        max: usize,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// One staged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    /// Register a new branch.
    PutBranch(Branch),
    /// Change a branch's lifecycle status.
    SetBranchStatus {
        /// Branch name.
        name: String,
        /// New status.
        status: BranchStatus,
    },
    /// Append an entity.
    InsertEntity(Entity),
    /// Append a merge history record.
    InsertMergeRecord(MergeRecord),
    /// Append a snapshot.
    InsertSnapshot(Snapshot),
}

impl WriteOp {
    /// Branch whose entity set or registry row this op changes.
    #[must_use]
    pub fn touched_branch(&self) -> Option<&str> {
        match self {
            Self::PutBranch(b) => Some(&b.name),
            Self::SetBranchStatus { name, .. } => Some(name),
            Self::InsertEntity(e) => Some(&e.branch_name),
            Self::InsertMergeRecord(_) | Self::InsertSnapshot(_) => None,
        }
    }
}

/// Optimistic concurrency guard: the commit fails unless `branch` is still at
/// `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchGuard {
    /// Guarded branch.
    pub branch: String,
    /// Version observed when the guard was taken.
    pub version: u64,
}

/// An atomic unit of work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    /// Mutations, applied in order.
    pub ops: Vec<WriteOp>,
    /// Version checks evaluated before anything is applied.
    #[serde(default)]
    pub guards: Vec<BranchGuard>,
}

impl WriteBatch {
    /// Returns true if nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// What a successful commit reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Store-wide commit sequence number.
    pub sequence: u64,
    /// Number of applied operations.
    pub applied: usize,
}

/// Filter for branch scans.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityFilter {
    /// Restrict to these kinds.
    pub kinds: Option<Vec<EntityKind>>,
    /// Inclusive upper bound on `created_at`.
    pub created_at_or_before: Option<DateTime<Utc>>,
    /// Inclusive lower bound on `created_at`.
    pub created_at_or_after: Option<DateTime<Utc>>,
    /// Restrict to this category (facts and observations).
    pub category: Option<String>,
}

impl EntityFilter {
    /// Matches everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches a single kind.
    #[must_use]
    pub fn kind(kind: EntityKind) -> Self {
        Self {
            kinds: Some(vec![kind]),
            ..Self::default()
        }
    }

    /// Restricts to the given kinds.
    #[must_use]
    pub fn with_kinds(mut self, kinds: &[EntityKind]) -> Self {
        self.kinds = Some(kinds.to_vec());
        self
    }

    /// Restricts to entities created at or before `at`.
    #[must_use]
    pub const fn as_of(mut self, at: DateTime<Utc>) -> Self {
        self.created_at_or_before = Some(at);
        self
    }

    /// Restricts to entities created at or after `at`.
    #[must_use]
    pub const fn since(mut self, at: DateTime<Utc>) -> Self {
        self.created_at_or_after = Some(at);
        self
    }

    /// Restricts to a category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Returns true if `entity` passes the filter.
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&entity.kind()) {
                return false;
            }
        }
        if let Some(at) = self.created_at_or_before {
            if entity.created_at > at {
                return false;
            }
        }
        if let Some(at) = self.created_at_or_after {
            if entity.created_at < at {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if entity.category() != Some(category.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Storage backend for all branch-scoped records.
///
/// Implementations must make [`Store::commit`] atomic and must order
/// [`Store::scan_branch`] results by `(created_at, id)`.
pub trait Store: Send + Sync {
    /// Look up a branch by name.
    fn get_branch(&self, name: &str) -> Result<Option<Branch>, StorageError>;

    /// List all branches ordered by name.
    fn list_branches(&self) -> Result<Vec<Branch>, StorageError>;

    /// Commit counter of a branch; 0 if the branch is unknown.
    fn branch_version(&self, name: &str) -> Result<u64, StorageError>;

    /// Get an entity by id, regardless of branch.
    fn get_entity(&self, id: EntityId) -> Result<Option<Entity>, StorageError>;

    /// Entities whose `branch_name` equals `branch` and that pass `filter`.
    fn scan_branch(&self, branch: &str, filter: &EntityFilter) -> Result<Vec<Entity>, StorageError>;

    /// Messages of a conversation ordered by sequence.
    fn conversation_messages(&self, conversation_id: EntityId) -> Result<Vec<Entity>, StorageError>;

    /// BM25 matches from the derived full-text index, best first.
    fn text_search(&self, branch: &str, query: &str) -> Result<Vec<(EntityId, f32)>, StorageError>;

    /// Get a merge record by id.
    fn get_merge_record(&self, id: MergeRecordId) -> Result<Option<MergeRecord>, StorageError>;

    /// Merge records where `branch` is source or target, oldest first.
    fn merge_records(&self, branch: &str) -> Result<Vec<MergeRecord>, StorageError>;

    /// Get a snapshot by id.
    fn get_snapshot(&self, id: SnapshotId) -> Result<Option<Snapshot>, StorageError>;

    /// Snapshots of a branch, oldest first.
    fn list_snapshots(&self, branch: &str) -> Result<Vec<Snapshot>, StorageError>;

    /// Validate and apply a batch atomically.
    fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StorageError>;

    /// Rebuild derived indexes from the entity table.
    fn rebuild_indexes(&self) -> Result<(), StorageError>;
}
