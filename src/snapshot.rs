//! Snapshots and time travel.
//!
//! Entities are immutable and never deleted, so the state of a branch at any
//! instant `t` is exactly the entities with `created_at <= t`. Time-travel
//! queries answer from the live tables with that filter. Snapshots are
//! checksummed, serialized copies of a branch's entity set for export and
//! restore.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::branch::{validate_branch_name, Branch, BranchManager};
use crate::context::RequestContext;
use crate::entity::{Entity, EntityId, EntityKind, EntityPayload};
use crate::error::{KyroMemResult, MemError, SnapshotError};
use crate::storage::{EntityFilter, Store, Transaction, WriteOp, DEFAULT_MAX_BATCH_OPS};

/// Unique identifier for a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(Uuid);

impl SnapshotId {
    /// Creates a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable capture of one branch's entity set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id.
    pub id: SnapshotId,
    /// Captured branch.
    pub branch_name: String,
    /// Caller-supplied label.
    pub label: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Number of captured entities.
    pub entity_count: usize,
    /// blake3 hex digest of `captured_data`.
    pub checksum: String,
    /// JSON array of the captured entities.
    pub captured_data: String,
}

impl Snapshot {
    fn capture(branch: &str, label: &str, entities: &[Entity]) -> Result<Self, SnapshotError> {
        let captured_data =
            serde_json::to_string(entities).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        Ok(Self {
            id: SnapshotId::new(),
            branch_name: branch.to_string(),
            label: label.to_string(),
            created_at: Utc::now(),
            entity_count: entities.len(),
            checksum: blake3::hash(captured_data.as_bytes()).to_hex().to_string(),
            captured_data,
        })
    }

    /// Decodes the captured entities after verifying the checksum.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumMismatch` if the data was altered, or `Serialization`
    /// if it no longer decodes.
    pub fn entities(&self) -> Result<Vec<Entity>, SnapshotError> {
        let actual = blake3::hash(self.captured_data.as_bytes()).to_hex().to_string();
        if actual != self.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                id: self.id.to_string(),
                expected: self.checksum.clone(),
                actual,
            });
        }
        serde_json::from_str(&self.captured_data).map_err(|e| SnapshotError::Serialization(e.to_string()))
    }
}

/// Creates and restores snapshots; answers time-travel queries.
pub struct SnapshotEngine {
    store: Arc<dyn Store>,
    branches: BranchManager,
    max_batch_ops: usize,
}

impl fmt::Debug for SnapshotEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotEngine").finish_non_exhaustive()
    }
}

impl SnapshotEngine {
    /// Creates an engine over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            branches: BranchManager::new(Arc::clone(&store)),
            store,
            max_batch_ops: DEFAULT_MAX_BATCH_OPS,
        }
    }

    /// Caps the operations a single restore may stage.
    #[must_use]
    pub const fn with_max_batch_ops(mut self, max_batch_ops: usize) -> Self {
        self.max_batch_ops = max_batch_ops;
        self
    }

    /// Captures the current entity set of `branch`.
    ///
    /// # Errors
    ///
    /// - `BranchNotFound` for an unknown branch
    /// - `Snapshot(Serialization)` if an entity cannot be serialized
    pub fn create_snapshot(&self, ctx: &RequestContext, branch: &str, label: &str) -> KyroMemResult<Snapshot> {
        self.branches.get_branch(branch)?;

        let mut tx = Transaction::begin(self.store.as_ref(), "create_snapshot").with_cancellation(ctx.cancel.clone());
        let entities = self.store.scan_branch(branch, &EntityFilter::all())?;
        let snapshot = Snapshot::capture(branch, label, &entities)?;
        tx.stage(WriteOp::InsertSnapshot(snapshot.clone()))?;
        tx.commit()?;

        tracing::info!(
            branch,
            label,
            snapshot = %snapshot.id,
            entities = snapshot.entity_count,
            "created snapshot"
        );
        Ok(snapshot)
    }

    /// Fetches a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Snapshot(NotFound)` for an unknown id.
    pub fn get_snapshot(&self, id: SnapshotId) -> KyroMemResult<Snapshot> {
        self.store
            .get_snapshot(id)?
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()).into())
    }

    /// Snapshots of `branch`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` for an unknown branch.
    pub fn list_snapshots(&self, branch: &str) -> KyroMemResult<Vec<Snapshot>> {
        self.branches.get_branch(branch)?;
        Ok(self.store.list_snapshots(branch)?)
    }

    /// Entities of `branch` as they existed at `at`, ordered by
    /// `(created_at, id)`.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` for an unknown branch.
    pub fn time_travel_query(&self, at: DateTime<Utc>, branch: &str) -> KyroMemResult<Vec<Entity>> {
        self.time_travel_filtered(at, branch, &EntityFilter::all())
    }

    /// [`SnapshotEngine::time_travel_query`] restricted to some kinds.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` for an unknown branch.
    pub fn time_travel_query_kinds(
        &self,
        at: DateTime<Utc>,
        branch: &str,
        kinds: &[EntityKind],
    ) -> KyroMemResult<Vec<Entity>> {
        self.time_travel_filtered(at, branch, &EntityFilter::all().with_kinds(kinds))
    }

    fn time_travel_filtered(
        &self,
        at: DateTime<Utc>,
        branch: &str,
        filter: &EntityFilter,
    ) -> KyroMemResult<Vec<Entity>> {
        self.branches.get_branch(branch)?;
        let filter = filter.clone().as_of(at);
        let entities = self.store.scan_branch(branch, &filter)?;
        tracing::debug!(branch, %at, entities = entities.len(), "time-travel query");
        Ok(entities)
    }

    /// Creates `new_branch` (child of the snapshot's branch) holding the
    /// captured entities: fresh ids, original timestamps, lineage recorded.
    ///
    /// # Errors
    ///
    /// - `Snapshot(NotFound | ChecksumMismatch | Serialization)`
    /// - `Validation` / `BranchExists` for the new name
    /// - `BranchNotFound` / `BranchInactive` for the snapshot's branch
    pub fn restore_snapshot(
        &self,
        ctx: &RequestContext,
        snapshot_id: SnapshotId,
        new_branch: &str,
    ) -> KyroMemResult<Branch> {
        let snapshot = self.get_snapshot(snapshot_id)?;
        let entities = snapshot.entities()?;
        validate_branch_name(new_branch)?;
        if self.store.get_branch(new_branch)?.is_some() {
            return Err(MemError::BranchExists(new_branch.to_string()));
        }
        self.branches.usable_branch(&snapshot.branch_name)?;

        let mut tx = Transaction::begin(self.store.as_ref(), "restore_snapshot")
            .with_limit(self.max_batch_ops)
            .with_cancellation(ctx.cancel.clone());
        let branch = Branch::child(new_branch, snapshot.branch_name.clone());
        tx.stage(WriteOp::PutBranch(branch.clone()))?;

        let mut remap: HashMap<EntityId, EntityId> = HashMap::new();
        for entity in &entities {
            let mut copy = entity.copy_to(new_branch, None);
            copy.supersedes = entity.supersedes.and_then(|old| remap.get(&old).copied());
            if let EntityPayload::Message(message) = &mut copy.payload {
                if let Some(conv) = remap.get(&message.conversation_id) {
                    message.conversation_id = *conv;
                }
            }
            remap.insert(entity.id, copy.id);
            tx.insert_entity(copy)?;
        }
        tx.commit()?;

        tracing::info!(
            snapshot = %snapshot_id,
            branch = new_branch,
            entities = entities.len(),
            "restored snapshot"
        );
        Ok(branch)
    }
}
