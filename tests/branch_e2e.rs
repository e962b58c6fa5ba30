//! Branch lifecycle end to end: copy-on-create, isolation, cherry-pick and
//! atomicity under induced storage failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use kyromem::branch::Branch;
use kyromem::entity::{Entity, EntityId, EntityKind, MessageRole};
use kyromem::merge::{MergeRecord, MergeRecordId};
use kyromem::snapshot::{Snapshot, SnapshotId};
use kyromem::storage::{CommitReceipt, EntityFilter, InMemoryStore, StorageError, Store, WriteBatch};
use kyromem::{KyroMem, MemError, RequestContext};

/// Store wrapper that fails on demand.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStore,
    fail_commit: AtomicBool,
    fail_scan_of: Mutex<Option<EntityKind>>,
    fail_messages: AtomicBool,
}

impl FlakyStore {
    fn fail_scan_of(&self, kind: EntityKind) {
        *self.fail_scan_of.lock().unwrap() = Some(kind);
    }
}

impl Store for FlakyStore {
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
        let failing = *self.fail_scan_of.lock().unwrap();
        if let (Some(kind), Some(kinds)) = (failing, &filter.kinds) {
            if kinds.contains(&kind) {
                return Err(StorageError::BackendError(format!("induced scan failure for {kind}")));
            }
        }
        self.inner.scan_branch(branch, filter)
    }

    fn conversation_messages(&self, conversation_id: EntityId) -> Result<Vec<Entity>, StorageError> {
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(StorageError::BackendError("induced message read failure".to_string()));
        }
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
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(StorageError::BackendError("induced commit failure".to_string()));
        }
        self.inner.commit(batch)
    }

    fn rebuild_indexes(&self) -> Result<(), StorageError> {
        self.inner.rebuild_indexes()
    }
}

fn flaky() -> (Arc<FlakyStore>, KyroMem) {
    let store = Arc::new(FlakyStore::default());
    let mem = KyroMem::new(store.clone());
    (store, mem)
}

/// A conversation with three messages, plus a fact, on `main`.
fn seed(mem: &KyroMem) -> EntityId {
    let ctx = RequestContext::main().with_session("s1");
    mem.write_fact(&ctx, "the deploy target is staging", "ops", 0.9).unwrap();
    let conv = mem.start_conversation(&ctx, None, Some("deploy")).unwrap();
    for (role, content) in [
        (MessageRole::User, "where do we deploy"),
        (MessageRole::Assistant, "staging"),
        (MessageRole::User, "thanks"),
    ] {
        mem.append_message(&ctx, conv.id, role, content, None).unwrap();
    }
    conv.id
}

fn count(store: &dyn Store, branch: &str, kind: EntityKind) -> usize {
    store.scan_branch(branch, &EntityFilter::kind(kind)).unwrap().len()
}

#[test]
fn create_branch_copies_requested_kinds() {
    let mem = KyroMem::in_memory();
    let conv = seed(&mem);
    let ctx = RequestContext::main();

    mem.create_branch(&ctx, "t1", "main", &[EntityKind::Message]).unwrap();
    let store = mem.store().as_ref();

    // Messages imply their conversations; facts were not requested.
    assert_eq!(count(store, "t1", EntityKind::Conversation), 1);
    assert_eq!(count(store, "t1", EntityKind::Message), 3);
    assert_eq!(count(store, "t1", EntityKind::Fact), 0);

    let copied_conv = &store.scan_branch("t1", &EntityFilter::kind(EntityKind::Conversation)).unwrap()[0];
    assert_eq!(copied_conv.origin, Some(conv));
    let messages = store.conversation_messages(copied_conv.id).unwrap();
    assert_eq!(messages.len(), 3);
    assert!(messages.iter().all(|m| m.branch_name == "t1"));

    let lineage: Vec<String> = mem.lineage("t1").unwrap().into_iter().map(|b| b.name).collect();
    assert_eq!(lineage, vec!["t1".to_string(), "main".to_string()]);
}

#[test]
fn branches_are_isolated() {
    let mem = KyroMem::in_memory();
    let ctx = RequestContext::main();
    mem.create_branch(&ctx, "t1", "main", &[]).unwrap();
    mem.write_fact(&ctx.for_branch("t1"), "only on t1", "general", 0.5).unwrap();
    mem.write_fact(&ctx, "only on main", "general", 0.5).unwrap();

    let store = mem.store().as_ref();
    let on_main = store.scan_branch("main", &EntityFilter::all()).unwrap();
    let on_t1 = store.scan_branch("t1", &EntityFilter::all()).unwrap();
    assert!(on_main.iter().all(|e| e.branch_name == "main"));
    assert!(on_t1.iter().all(|e| e.branch_name == "t1"));
    assert_eq!(on_main.len(), 1);
    assert_eq!(on_t1.len(), 1);
}

#[test]
fn create_branch_errors() {
    let mem = KyroMem::in_memory();
    let ctx = RequestContext::main();
    mem.create_branch(&ctx, "t1", "main", &[]).unwrap();

    assert!(matches!(
        mem.create_branch(&ctx, "t1", "main", &[]).unwrap_err(),
        MemError::BranchExists(_)
    ));
    assert!(matches!(
        mem.create_branch(&ctx, "t2", "ghost", &[]).unwrap_err(),
        MemError::BranchNotFound(_)
    ));
    assert!(mem.create_branch(&ctx, "bad name!", "main", &[]).unwrap_err().is_validation());

    mem.delete_branch(&ctx, "t1").unwrap();
    assert!(matches!(
        mem.create_branch(&ctx, "t3", "t1", &[]).unwrap_err(),
        MemError::BranchInactive { .. }
    ));
    assert!(mem.delete_branch(&ctx, "main").unwrap_err().is_validation());
}

#[test]
fn failure_during_copy_leaves_nothing() {
    let (store, mem) = flaky();
    seed(&mem);
    // Conversations and messages are staged before facts are read.
    store.fail_scan_of(EntityKind::Fact);

    let err = mem
        .create_branch(&RequestContext::main(), "t1", "main", &EntityKind::ALL)
        .unwrap_err();
    assert!(err.is_storage());
    assert!(store.get_branch("t1").unwrap().is_none());
    assert!(store.inner.scan_branch("t1", &EntityFilter::all()).unwrap().is_empty());
}

#[test]
fn failure_at_commit_leaves_nothing() {
    let (store, mem) = flaky();
    seed(&mem);
    store.fail_commit.store(true, Ordering::SeqCst);

    let err = mem
        .create_branch(&RequestContext::main(), "t1", "main", &EntityKind::ALL)
        .unwrap_err();
    assert!(err.is_storage());
    assert!(store.get_branch("t1").unwrap().is_none());
    assert!(store.scan_branch("t1", &EntityFilter::all()).unwrap().is_empty());
}

#[test]
fn cherry_pick_copies_ordered_messages() {
    let mem = KyroMem::in_memory();
    let conv = seed(&mem);
    let ctx = RequestContext::main();
    mem.create_branch(&ctx, "t1", "main", &[]).unwrap();

    let picked = mem.cherry_pick_conversation(&ctx, conv, "t1").unwrap();
    assert_eq!(picked.messages, 3);
    assert_ne!(picked.conversation.id, conv);
    assert_eq!(picked.conversation.branch_name, "t1");

    let original = mem.store().conversation_messages(conv).unwrap();
    let copies = mem.store().conversation_messages(picked.conversation.id).unwrap();
    let body = |es: &[Entity]| -> Vec<(u32, MessageRole, String)> {
        es.iter()
            .filter_map(|e| e.as_message())
            .map(|m| (m.sequence, m.role, m.content.clone()))
            .collect()
    };
    assert_eq!(body(&original), body(&copies));
    // Copies are new events on the target.
    assert!(copies.iter().all(|c| c.created_at >= original[2].created_at));
}

#[test]
fn cherry_pick_is_atomic() {
    let (store, mem) = flaky();
    let conv = seed(&mem);
    mem.create_branch(&RequestContext::main(), "t1", "main", &[]).unwrap();

    store.fail_messages.store(true, Ordering::SeqCst);
    assert!(mem.cherry_pick_conversation(&RequestContext::main(), conv, "t1").is_err());
    store.fail_messages.store(false, Ordering::SeqCst);

    store.fail_commit.store(true, Ordering::SeqCst);
    assert!(mem.cherry_pick_conversation(&RequestContext::main(), conv, "t1").is_err());

    assert_eq!(count(store.as_ref(), "t1", EntityKind::Conversation), 0);
    assert_eq!(count(store.as_ref(), "t1", EntityKind::Message), 0);
}

#[test]
fn deleted_branch_rejects_writes_but_stays_readable() {
    let mem = KyroMem::in_memory();
    let ctx = RequestContext::main();
    mem.create_branch(&ctx, "t1", "main", &[]).unwrap();
    mem.write_fact(&ctx.for_branch("t1"), "kept", "general", 0.5).unwrap();
    mem.delete_branch(&ctx, "t1").unwrap();

    let err = mem.write_fact(&ctx.for_branch("t1"), "rejected", "general", 0.5).unwrap_err();
    assert!(matches!(err, MemError::BranchInactive { .. }));
    assert_eq!(count(mem.store().as_ref(), "t1", EntityKind::Fact), 1);
}
