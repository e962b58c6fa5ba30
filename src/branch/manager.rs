//! Branch lifecycle: bootstrap, copy-on-create, cherry-pick and retirement.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;

use crate::branch::{validate_branch_name, Branch, BranchStatus, MAIN_BRANCH};
use crate::context::RequestContext;
use crate::entity::{Entity, EntityId, EntityKind, EntityPayload};
use crate::error::{KyroMemResult, MemError, ValidationError};
use crate::storage::{EntityFilter, StorageError, Store, Transaction, WriteOp, DEFAULT_MAX_BATCH_OPS};

/// Result of a conversation cherry-pick.
#[derive(Debug, Clone, PartialEq)]
pub struct CherryPick {
    /// The new conversation on the target branch.
    pub conversation: Entity,
    /// Number of messages copied with it.
    pub messages: usize,
}

/// Owns the branch registry and every operation that copies data between branches.
pub struct BranchManager {
    store: Arc<dyn Store>,
    max_batch_ops: usize,
}

impl std::fmt::Debug for BranchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchManager")
            .field("max_batch_ops", &self.max_batch_ops)
            .finish_non_exhaustive()
    }
}

impl BranchManager {
    /// Creates a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            max_batch_ops: DEFAULT_MAX_BATCH_OPS,
        }
    }

    /// Caps the operations a single copy may stage.
    #[must_use]
    pub const fn with_max_batch_ops(mut self, max_batch_ops: usize) -> Self {
        self.max_batch_ops = max_batch_ops;
        self
    }

    /// Creates `main` if it does not exist yet and returns it.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn ensure_main_branch(&self) -> KyroMemResult<Branch> {
        if let Some(main) = self.store.get_branch(MAIN_BRANCH)? {
            return Ok(main);
        }

        let mut tx = Transaction::begin(self.store.as_ref(), "ensure_main_branch");
        tx.stage(WriteOp::PutBranch(Branch::root()))?;
        match tx.commit() {
            Ok(_) => tracing::info!(branch = MAIN_BRANCH, "created root branch"),
            // Lost a bootstrap race; the winner's row is just as good.
            Err(MemError::Storage(StorageError::DuplicateKey(_))) => {}
            Err(err) => return Err(err),
        }
        self.get_branch(MAIN_BRANCH)
    }

    /// Looks up a branch.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` if no branch has that name.
    pub fn get_branch(&self, name: &str) -> KyroMemResult<Branch> {
        self.store
            .get_branch(name)?
            .ok_or_else(|| MemError::BranchNotFound(name.to_string()))
    }

    /// Looks up a branch that may still be written to.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound`, or `BranchInactive` for a deleted branch.
    pub fn usable_branch(&self, name: &str) -> KyroMemResult<Branch> {
        let branch = self.get_branch(name)?;
        if !branch.is_usable() {
            return Err(MemError::BranchInactive {
                name: branch.name,
                status: branch.status,
            });
        }
        Ok(branch)
    }

    /// All branches ordered by name.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn list_branches(&self) -> KyroMemResult<Vec<Branch>> {
        Ok(self.store.list_branches()?)
    }

    /// The branch followed by its ancestors, ending at `main`.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` for `name` or for a missing ancestor.
    pub fn lineage(&self, name: &str) -> KyroMemResult<Vec<Branch>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(name.to_string());
        while let Some(current) = next {
            if !seen.insert(current.clone()) {
                break;
            }
            let branch = self.get_branch(&current)?;
            next = branch.parent_branch.clone();
            chain.push(branch);
        }
        Ok(chain)
    }

    /// Creates `name` as a child of `parent`, copying the parent's current
    /// entities of the requested kinds onto it.
    ///
    /// Copies get fresh ids, keep their content and `created_at`, and record
    /// their lineage in `origin`. Copying messages implies copying
    /// conversations; copied messages point at the copied conversation. The
    /// branch row and every copy are committed together or not at all.
    ///
    /// # Errors
    ///
    /// - `Validation` for a malformed name
    /// - `BranchExists` if `name` is taken
    /// - `BranchNotFound` / `BranchInactive` if `parent` is missing or deleted
    /// - `Storage` (including `WriteConflict`) or `Execution(Cancelled)` at commit
    pub fn create_branch(
        &self,
        ctx: &RequestContext,
        name: &str,
        parent: &str,
        kinds: &[EntityKind],
    ) -> KyroMemResult<Branch> {
        validate_branch_name(name)?;
        if self.store.get_branch(name)?.is_some() {
            return Err(MemError::BranchExists(name.to_string()));
        }
        self.usable_branch(parent)?;

        let mut tx = Transaction::begin(self.store.as_ref(), "create_branch")
            .with_limit(self.max_batch_ops)
            .with_cancellation(ctx.cancel.clone());
        tx.guard_branch(parent)?;

        let branch = Branch::child(name, parent);
        tx.stage(WriteOp::PutBranch(branch.clone()))?;

        let mut remap: HashMap<EntityId, EntityId> = HashMap::new();
        let mut copied: Vec<(EntityKind, usize)> = Vec::new();
        for kind in copy_order(kinds) {
            ctx.cancel.check()?;
            let entities = self.store.scan_branch(parent, &EntityFilter::kind(kind))?;
            copied.push((kind, entities.len()));
            for entity in &entities {
                let mut copy = entity.copy_to(name, None);
                copy.supersedes = entity.supersedes.and_then(|old| remap.get(&old).copied());
                if let EntityPayload::Message(message) = &mut copy.payload {
                    if let Some(conversation) = remap.get(&message.conversation_id) {
                        message.conversation_id = *conversation;
                    }
                }
                remap.insert(entity.id, copy.id);
                tx.insert_entity(copy)?;
            }
        }

        tx.commit()?;
        tracing::info!(
            branch = name,
            parent,
            copied = ?copied,
            "created branch"
        );
        Ok(branch)
    }

    /// Copies one conversation and its messages onto `target`.
    ///
    /// The copies are new events on the target: fresh ids, stamped now, with
    /// order, roles, content and tool calls preserved.
    ///
    /// # Errors
    ///
    /// - `EntityNotFound` if `conversation_id` is not a conversation
    /// - `BranchNotFound` / `BranchInactive` for the target
    /// - `Storage` (including `WriteConflict`) or `Execution(Cancelled)` at commit
    pub fn cherry_pick_conversation(
        &self,
        ctx: &RequestContext,
        conversation_id: EntityId,
        target: &str,
    ) -> KyroMemResult<CherryPick> {
        let conversation = self
            .store
            .get_entity(conversation_id)?
            .filter(|e| e.kind() == EntityKind::Conversation)
            .ok_or_else(|| MemError::not_found(EntityKind::Conversation, conversation_id))?;
        self.usable_branch(target)?;

        let mut tx = Transaction::begin(self.store.as_ref(), "cherry_pick_conversation")
            .with_limit(self.max_batch_ops)
            .with_cancellation(ctx.cancel.clone());
        tx.guard_branch(target)?;

        let stamp = Utc::now();
        let header = conversation.copy_to(target, Some(stamp));
        let messages = self.store.conversation_messages(conversation_id)?;
        tx.insert_entity(header.clone())?;
        for message in &messages {
            let mut copy = message.copy_to(target, Some(stamp));
            if let EntityPayload::Message(m) = &mut copy.payload {
                m.conversation_id = header.id;
            }
            tx.insert_entity(copy)?;
        }

        tx.commit()?;
        tracing::info!(
            source_branch = %conversation.branch_name,
            target_branch = target,
            conversation = %header.id,
            messages = messages.len(),
            "cherry-picked conversation"
        );
        Ok(CherryPick {
            conversation: header,
            messages: messages.len(),
        })
    }

    /// Retires a branch. Its data stays readable; writes, merges and use as a
    /// parent are rejected afterwards. Deleting an already deleted branch is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// - `Validation` when asked to delete `main`
    /// - `BranchNotFound` if the branch does not exist
    pub fn delete_branch(&self, ctx: &RequestContext, name: &str) -> KyroMemResult<Branch> {
        if name == MAIN_BRANCH {
            return Err(ValidationError::InvalidOperation {
                reason: "the main branch cannot be deleted".to_string(),
            }
            .into());
        }
        let mut branch = self.get_branch(name)?;
        if branch.status == BranchStatus::Deleted {
            return Ok(branch);
        }

        let mut tx = Transaction::begin(self.store.as_ref(), "delete_branch").with_cancellation(ctx.cancel.clone());
        tx.guard_branch(name)?;
        tx.stage(WriteOp::SetBranchStatus {
            name: name.to_string(),
            status: BranchStatus::Deleted,
        })?;
        tx.commit()?;

        tracing::info!(branch = name, "deleted branch");
        branch.status = BranchStatus::Deleted;
        Ok(branch)
    }
}

/// Requested kinds in dependency order, with conversations pulled in by messages.
fn copy_order(kinds: &[EntityKind]) -> Vec<EntityKind> {
    let mut wanted: BTreeSet<EntityKind> = kinds.iter().copied().collect();
    if wanted.contains(&EntityKind::Message) {
        wanted.insert(EntityKind::Conversation);
    }
    EntityKind::ALL
        .into_iter()
        .filter(|kind| wanted.contains(kind))
        .collect()
}
