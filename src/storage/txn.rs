//! Staged, all-or-nothing write transactions.
//!
//! A [`Transaction`] buffers every mutation of one logical operation and hands
//! the batch to [`Store::commit`] exactly once. Nothing reaches the store before
//! that; dropping a transaction without committing discards the staged work,
//! which is how every multi-step operation rolls back before raising.

use crate::context::CancellationToken;
use crate::entity::Entity;
use crate::error::KyroMemResult;
use crate::storage::traits::{BranchGuard, CommitReceipt, Store, StorageError, WriteBatch, WriteOp};

/// Default cap on staged operations per transaction.
pub const DEFAULT_MAX_BATCH_OPS: usize = 100_000;

/// A write transaction over a [`Store`].
pub struct Transaction<'a> {
    store: &'a dyn Store,
    batch: WriteBatch,
    max_ops: usize,
    cancel: Option<CancellationToken>,
    label: &'static str,
}

impl<'a> Transaction<'a> {
    /// Starts an empty transaction.
    #[must_use]
    pub fn begin(store: &'a dyn Store, label: &'static str) -> Self {
        Self {
            store,
            batch: WriteBatch::default(),
            max_ops: DEFAULT_MAX_BATCH_OPS,
            cancel: None,
            label,
        }
    }

    /// Caps the number of staged operations.
    #[must_use]
    pub const fn with_limit(mut self, max_ops: usize) -> Self {
        self.max_ops = max_ops;
        self
    }

    /// Aborts the commit if `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Reads the current version of `branch` and fails the commit if another
    /// commit touches it first.
    ///
    /// # Errors
    ///
    /// Propagates storage read failures.
    pub fn guard_branch(&mut self, branch: &str) -> KyroMemResult<u64> {
        let version = self.store.branch_version(branch)?;
        self.batch.guards.retain(|g| g.branch != branch);
        self.batch.guards.push(BranchGuard {
            branch: branch.to_string(),
            version,
        });
        Ok(version)
    }

    /// Stages one operation.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BatchTooLarge` once the cap is exceeded.
    pub fn stage(&mut self, op: WriteOp) -> KyroMemResult<()> {
        if self.batch.ops.len() >= self.max_ops {
            return Err(StorageError::BatchTooLarge {
                ops: self.batch.ops.len() + 1,
                max: self.max_ops,
            }
            .into());
        }
        self.batch.ops.push(op);
        Ok(())
    }

    /// Stages an entity insert.
    ///
    /// # Errors
    ///
    /// See [`Transaction::stage`].
    pub fn insert_entity(&mut self, entity: Entity) -> KyroMemResult<()> {
        self.stage(WriteOp::InsertEntity(entity))
    }

    /// Number of staged operations.
    #[must_use]
    pub fn staged(&self) -> usize {
        self.batch.ops.len()
    }

    /// Staged entity inserts, in order.
    pub fn staged_entities(&self) -> impl Iterator<Item = &Entity> {
        self.batch.ops.iter().filter_map(|op| match op {
            WriteOp::InsertEntity(e) => Some(e),
            _ => None,
        })
    }

    /// Commits the batch atomically.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the token fired, or the store's commit error. In
    /// both cases nothing was written.
    pub fn commit(mut self) -> KyroMemResult<CommitReceipt> {
        if let Some(token) = &self.cancel {
            token.check()?;
        }
        let batch = std::mem::take(&mut self.batch);
        let ops = batch.ops.len();
        match self.store.commit(batch) {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                tracing::debug!(txn = self.label, ops, error = %err, "commit rejected");
                Err(err.into())
            }
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.batch.ops.is_empty() {
            tracing::debug!(
                txn = self.label,
                discarded = self.batch.ops.len(),
                "transaction rolled back"
            );
        }
    }
}
