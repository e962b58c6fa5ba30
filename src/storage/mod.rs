//! Entity store: the append-only substrate every engine reads and writes.
//!
//! - [`Store`]: backend interface (reads, atomic batch commit, index rebuild)
//! - [`InMemoryStore`]: `RwLock`-guarded tables with derived indexes
//! - [`Transaction`]: stage-then-commit wrapper used by multi-step operations
//! - `persistent` (feature): the same tables behind a write-ahead journal

mod fulltext;
mod memory;
mod traits;
mod txn;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemoryStore;
pub use traits::{
    BranchGuard, CommitReceipt, EntityFilter, StorageError, Store, WriteBatch, WriteOp,
};
pub use txn::{Transaction, DEFAULT_MAX_BATCH_OPS};

pub(crate) use fulltext::tokens;
