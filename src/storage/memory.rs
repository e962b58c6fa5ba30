//! In-memory storage backend.
//!
//! [`StoreState`] holds every table plus the derived indexes. [`InMemoryStore`]
//! guards it with an `RwLock`; a commit validates the whole batch and applies
//! it under a single write lock, so readers never observe a partial batch.
//! The persistent backend reuses the same state and adds a write-ahead journal.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use crate::branch::{Branch, BranchStatus};
use crate::entity::{Entity, EntityId, EntityPayload};
use crate::merge::{MergeRecord, MergeRecordId};
use crate::snapshot::{Snapshot, SnapshotId};
use crate::storage::fulltext::FullTextIndex;
use crate::storage::traits::{CommitReceipt, EntityFilter, Store, StorageError, WriteBatch, WriteOp};

pub(crate) fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Durable sink a backend writes each validated batch to before applying it.
pub(crate) trait Journal: Send + Sync {
    fn append(&self, sequence: u64, batch: &WriteBatch) -> Result<(), StorageError>;
}

/// All tables of the store.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    branches: BTreeMap<String, Branch>,
    branch_versions: HashMap<String, u64>,
    entities: HashMap<EntityId, Entity>,
    by_branch: HashMap<String, Vec<EntityId>>,
    messages_by_conversation: HashMap<EntityId, Vec<EntityId>>,
    merge_records: HashMap<MergeRecordId, MergeRecord>,
    merges_by_branch: HashMap<String, Vec<MergeRecordId>>,
    snapshots: HashMap<SnapshotId, Snapshot>,
    snapshots_by_branch: HashMap<String, Vec<SnapshotId>>,
    fulltext: FullTextIndex,
    sequence: u64,
}

impl StoreState {
    pub(crate) const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Validates a batch against current state without mutating anything.
    pub(crate) fn check(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        for guard in &batch.guards {
            let actual = self.version_of(&guard.branch);
            if actual != guard.version {
                return Err(StorageError::WriteConflict {
                    branch: guard.branch.clone(),
                    expected: guard.version,
                    actual,
                });
            }
        }

        let mut new_branches: HashMap<&str, BranchStatus> = HashMap::new();
        let mut new_ids: HashSet<EntityId> = HashSet::new();
        let mut new_records: HashSet<MergeRecordId> = HashSet::new();
        let mut new_snapshots: HashSet<SnapshotId> = HashSet::new();

        let status_of = |name: &str, staged: &HashMap<&str, BranchStatus>| -> Option<BranchStatus> {
            staged
                .get(name)
                .copied()
                .or_else(|| self.branches.get(name).map(|b| b.status))
        };

        for op in &batch.ops {
            match op {
                WriteOp::PutBranch(branch) => {
                    if self.branches.contains_key(&branch.name) || new_branches.contains_key(branch.name.as_str()) {
                        return Err(StorageError::DuplicateKey(format!("branch:{}", branch.name)));
                    }
                    if let Some(parent) = &branch.parent_branch {
                        match status_of(parent, &new_branches) {
                            None => return Err(StorageError::UnknownBranch(parent.clone())),
                            Some(BranchStatus::Deleted) => return Err(StorageError::BranchClosed(parent.clone())),
                            Some(_) => {}
                        }
                    }
                    new_branches.insert(&branch.name, branch.status);
                }
                WriteOp::SetBranchStatus { name, status } => {
                    if status_of(name, &new_branches).is_none() {
                        return Err(StorageError::UnknownBranch(name.clone()));
                    }
                    new_branches.insert(name, *status);
                }
                WriteOp::InsertEntity(entity) => {
                    match status_of(&entity.branch_name, &new_branches) {
                        None => return Err(StorageError::UnknownBranch(entity.branch_name.clone())),
                        Some(BranchStatus::Deleted) => {
                            return Err(StorageError::BranchClosed(entity.branch_name.clone()))
                        }
                        Some(_) => {}
                    }
                    if self.entities.contains_key(&entity.id) || !new_ids.insert(entity.id) {
                        return Err(StorageError::DuplicateKey(format!("entity:{}", entity.id)));
                    }
                }
                WriteOp::InsertMergeRecord(record) => {
                    if self.merge_records.contains_key(&record.id) || !new_records.insert(record.id) {
                        return Err(StorageError::DuplicateKey(format!("merge:{}", record.id)));
                    }
                }
                WriteOp::InsertSnapshot(snapshot) => {
                    if status_of(&snapshot.branch_name, &new_branches).is_none() {
                        return Err(StorageError::UnknownBranch(snapshot.branch_name.clone()));
                    }
                    if self.snapshots.contains_key(&snapshot.id) || !new_snapshots.insert(snapshot.id) {
                        return Err(StorageError::DuplicateKey(format!("snapshot:{}", snapshot.id)));
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies a batch that already passed [`StoreState::check`].
    pub(crate) fn apply(&mut self, batch: WriteBatch) -> CommitReceipt {
        let applied = batch.ops.len();
        let mut touched: HashSet<String> = HashSet::new();

        for op in batch.ops {
            if let Some(branch) = op.touched_branch() {
                touched.insert(branch.to_string());
            }
            match op {
                WriteOp::PutBranch(branch) => {
                    self.branches.insert(branch.name.clone(), branch);
                }
                WriteOp::SetBranchStatus { name, status } => {
                    if let Some(branch) = self.branches.get_mut(&name) {
                        branch.status = status;
                    }
                }
                WriteOp::InsertEntity(entity) => self.insert_entity(entity),
                WriteOp::InsertMergeRecord(record) => {
                    for branch in [&record.source_branch, &record.target_branch] {
                        self.merges_by_branch.entry(branch.clone()).or_default().push(record.id);
                    }
                    self.merge_records.insert(record.id, record);
                }
                WriteOp::InsertSnapshot(snapshot) => {
                    self.snapshots_by_branch
                        .entry(snapshot.branch_name.clone())
                        .or_default()
                        .push(snapshot.id);
                    self.snapshots.insert(snapshot.id, snapshot);
                }
            }
        }

        for branch in touched {
            *self.branch_versions.entry(branch).or_insert(0) += 1;
        }
        self.sequence += 1;
        CommitReceipt {
            sequence: self.sequence,
            applied,
        }
    }

    fn insert_entity(&mut self, entity: Entity) {
        self.fulltext.add(&entity);
        self.by_branch.entry(entity.branch_name.clone()).or_default().push(entity.id);
        if let EntityPayload::Message(message) = &entity.payload {
            self.messages_by_conversation
                .entry(message.conversation_id)
                .or_default()
                .push(entity.id);
        }
        self.entities.insert(entity.id, entity);
    }

    pub(crate) fn version_of(&self, branch: &str) -> u64 {
        self.branch_versions.get(branch).copied().unwrap_or(0)
    }

    pub(crate) fn get_branch(&self, name: &str) -> Option<Branch> {
        self.branches.get(name).cloned()
    }

    pub(crate) fn list_branches(&self) -> Vec<Branch> {
        self.branches.values().cloned().collect()
    }

    pub(crate) fn get_entity(&self, id: EntityId) -> Option<Entity> {
        self.entities.get(&id).cloned()
    }

    pub(crate) fn scan_branch(&self, branch: &str, filter: &EntityFilter) -> Vec<Entity> {
        let mut out: Vec<Entity> = self
            .by_branch
            .get(branch)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entities.get(id))
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub(crate) fn conversation_messages(&self, conversation_id: EntityId) -> Vec<Entity> {
        let mut out: Vec<Entity> = self
            .messages_by_conversation
            .get(&conversation_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entities.get(id))
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.as_message().map_or(u32::MAX, |m| m.sequence), e.created_at));
        out
    }

    pub(crate) fn text_search(&self, branch: &str, query: &str) -> Vec<(EntityId, f32)> {
        self.fulltext.search(branch, query)
    }

    pub(crate) fn get_merge_record(&self, id: MergeRecordId) -> Option<MergeRecord> {
        self.merge_records.get(&id).cloned()
    }

    pub(crate) fn merge_records(&self, branch: &str) -> Vec<MergeRecord> {
        let mut out: Vec<MergeRecord> = self
            .merges_by_branch
            .get(branch)
            .into_iter()
            .flatten()
            .filter_map(|id| self.merge_records.get(id))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        out.dedup_by_key(|r| r.id);
        out
    }

    pub(crate) fn get_snapshot(&self, id: SnapshotId) -> Option<Snapshot> {
        self.snapshots.get(&id).cloned()
    }

    pub(crate) fn list_snapshots(&self, branch: &str) -> Vec<Snapshot> {
        let mut out: Vec<Snapshot> = self
            .snapshots_by_branch
            .get(branch)
            .into_iter()
            .flatten()
            .filter_map(|id| self.snapshots.get(id))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    pub(crate) fn rebuild_indexes(&mut self) {
        self.fulltext.clear();
        self.by_branch.clear();
        self.messages_by_conversation.clear();

        let mut all: Vec<&Entity> = self.entities.values().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        for entity in all {
            self.fulltext.add(entity);
            self.by_branch.entry(entity.branch_name.clone()).or_default().push(entity.id);
            if let EntityPayload::Message(message) = &entity.payload {
                self.messages_by_conversation
                    .entry(message.conversation_id)
                    .or_default()
                    .push(entity.id);
            }
        }
    }
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    journal: Option<Box<dyn Journal>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("journaled", &self.journal.is_some())
            .finish_non_exhaustive()
    }
}

impl InMemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_journal(state: StoreState, journal: Box<dyn Journal>) -> Self {
        Self {
            state: RwLock::new(state),
            journal: Some(journal),
        }
    }

    fn read(&self, context: &'static str) -> Result<std::sync::RwLockReadGuard<'_, StoreState>, StorageError> {
        self.state.read().map_err(|_| lock_err(context))
    }
}

impl Store for InMemoryStore {
    fn get_branch(&self, name: &str) -> Result<Option<Branch>, StorageError> {
        Ok(self.read("branch.get")?.get_branch(name))
    }

    fn list_branches(&self) -> Result<Vec<Branch>, StorageError> {
        Ok(self.read("branch.list")?.list_branches())
    }

    fn branch_version(&self, name: &str) -> Result<u64, StorageError> {
        Ok(self.read("branch.version")?.version_of(name))
    }

    fn get_entity(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        Ok(self.read("entity.get")?.get_entity(id))
    }

    fn scan_branch(&self, branch: &str, filter: &EntityFilter) -> Result<Vec<Entity>, StorageError> {
        Ok(self.read("entity.scan")?.scan_branch(branch, filter))
    }

    fn conversation_messages(&self, conversation_id: EntityId) -> Result<Vec<Entity>, StorageError> {
        Ok(self.read("message.scan")?.conversation_messages(conversation_id))
    }

    fn text_search(&self, branch: &str, query: &str) -> Result<Vec<(EntityId, f32)>, StorageError> {
        Ok(self.read("fulltext.search")?.text_search(branch, query))
    }

    fn get_merge_record(&self, id: MergeRecordId) -> Result<Option<MergeRecord>, StorageError> {
        Ok(self.read("merge.get")?.get_merge_record(id))
    }

    fn merge_records(&self, branch: &str) -> Result<Vec<MergeRecord>, StorageError> {
        Ok(self.read("merge.list")?.merge_records(branch))
    }

    fn get_snapshot(&self, id: SnapshotId) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.read("snapshot.get")?.get_snapshot(id))
    }

    fn list_snapshots(&self, branch: &str) -> Result<Vec<Snapshot>, StorageError> {
        Ok(self.read("snapshot.list")?.list_snapshots(branch))
    }

    fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("commit"))?;
        state.check(&batch)?;
        if let Some(journal) = &self.journal {
            journal.append(state.sequence() + 1, &batch)?;
        }
        let receipt = state.apply(batch);
        tracing::debug!(
            sequence = receipt.sequence,
            applied = receipt.applied,
            "committed batch"
        );
        Ok(receipt)
    }

    fn rebuild_indexes(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("rebuild"))?;
        state.rebuild_indexes();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Fact, Relation};
    use crate::storage::traits::BranchGuard;

    fn store_with_main() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .commit(WriteBatch {
                ops: vec![WriteOp::PutBranch(Branch::root())],
                guards: Vec::new(),
            })
            .unwrap();
        store
    }

    fn fact(branch: &str, text: &str) -> Entity {
        Entity::new(branch, EntityPayload::Fact(Fact::new(text, "general", 0.5).unwrap()))
    }

    #[test]
    fn commit_is_all_or_nothing() {
        let store = store_with_main();
        let good = fact("main", "kept out");
        let bad = fact("nowhere", "unknown branch");

        let err = store
            .commit(WriteBatch {
                ops: vec![WriteOp::InsertEntity(good.clone()), WriteOp::InsertEntity(bad)],
                guards: Vec::new(),
            })
            .unwrap_err();
        assert_eq!(err, StorageError::UnknownBranch("nowhere".to_string()));
        assert!(store.get_entity(good.id).unwrap().is_none());
        assert!(store.text_search("main", "kept").unwrap().is_empty());
    }

    #[test]
    fn duplicate_ids_rejected_within_batch() {
        let store = store_with_main();
        let e = fact("main", "twice");
        let err = store
            .commit(WriteBatch {
                ops: vec![WriteOp::InsertEntity(e.clone()), WriteOp::InsertEntity(e)],
                guards: Vec::new(),
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
    }

    #[test]
    fn guard_detects_concurrent_commit() {
        let store = store_with_main();
        let seen = store.branch_version("main").unwrap();

        store
            .commit(WriteBatch {
                ops: vec![WriteOp::InsertEntity(fact("main", "racer"))],
                guards: Vec::new(),
            })
            .unwrap();

        let err = store
            .commit(WriteBatch {
                ops: vec![WriteOp::InsertEntity(fact("main", "loser"))],
                guards: vec![BranchGuard {
                    branch: "main".to_string(),
                    version: seen,
                }],
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::WriteConflict { expected, actual, .. } if actual == expected + 1));
    }

    #[test]
    fn deleted_branch_rejects_writes() {
        let store = store_with_main();
        store
            .commit(WriteBatch {
                ops: vec![
                    WriteOp::PutBranch(Branch::child("old", "main")),
                    WriteOp::SetBranchStatus {
                        name: "old".to_string(),
                        status: BranchStatus::Deleted,
                    },
                ],
                guards: Vec::new(),
            })
            .unwrap();

        let err = store
            .commit(WriteBatch {
                ops: vec![WriteOp::InsertEntity(fact("old", "late"))],
                guards: Vec::new(),
            })
            .unwrap_err();
        assert_eq!(err, StorageError::BranchClosed("old".to_string()));
    }

    #[test]
    fn rebuild_restores_indexes() {
        let store = store_with_main();
        let rel = Entity::new("main", EntityPayload::Relation(Relation::new("A", "B", "uses", 0.9).unwrap()));
        let f = fact("main", "searchable words");
        store
            .commit(WriteBatch {
                ops: vec![WriteOp::InsertEntity(rel), WriteOp::InsertEntity(f.clone())],
                guards: Vec::new(),
            })
            .unwrap();

        store.rebuild_indexes().unwrap();
        let hits = store.text_search("main", "searchable").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, f.id);
        assert_eq!(store.scan_branch("main", &EntityFilter::all()).unwrap().len(), 2);
    }
}
