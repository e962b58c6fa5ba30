//! # KyroMem - Versioned Memory for Agent Context
//!
//! KyroMem records what an AI agent knows (facts, observations, relations) and
//! what it said (sessions, conversations, messages) as immutable,
//! branch-scoped entities, and versions them the way git versions files.
//!
//! ## Core Concepts
//!
//! - **Branch**: an isolated line of memory. Reads never fall through to the
//!   parent; data moves between branches only by copy, cherry-pick, merge or
//!   snapshot restore
//! - **Merge**: copies what a branch learned since its fork point, surfacing
//!   conflicting relations and near-duplicate facts as values
//! - **Snapshot / time travel**: checksummed captures and creation-time views
//! - **Retrieval**: relation-graph traversal and hybrid BM25 + vector search
//! - **Evaluation**: conversation replay, judge scoring and semantic diff
//!
//! ## Usage
//!
//! ```rust
//! use kyromem::{KyroMem, MergeStrategy, RequestContext, SearchRequest};
//!
//! # fn main() -> kyromem::KyroMemResult<()> {
//! let mem = KyroMem::in_memory();
//! let main = RequestContext::main();
//!
//! mem.create_branch(&main, "experiment", "main", &[])?;
//! let exp = main.for_branch("experiment");
//! mem.write_fact(&exp, "deploys go to staging first", "ops", 0.9)?;
//!
//! let merged = mem.merge(&main, "experiment", "main", Some(MergeStrategy::Manual))?;
//! assert!(merged.is_merged());
//!
//! let hits = mem.search(&SearchRequest::new("staging", "main"))?;
//! assert_eq!(hits.hits.len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod context;
pub mod embedding;
pub mod entity;
pub mod error;
pub mod time;

// Storage and engines
pub mod branch;
pub mod engine;
pub mod graph;
pub mod merge;
pub mod replay;
pub mod search;
pub mod snapshot;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use branch::{Branch, BranchManager, BranchStatus, CherryPick, MAIN_BRANCH};
pub use context::{CancellationToken, RequestContext};
pub use embedding::{EmbeddingError, EmbeddingProvider, LexicalEmbedder, TimedEmbedder};
pub use engine::runtime::{MemRuntime, Pool, RuntimeConfig, TaskHandle};
pub use engine::{EmbeddingPolicy, EngineConfig, KyroMem};
pub use entity::{
    Conversation, Entity, EntityId, EntityKind, EntityPayload, Envelope, Fact, Message, MessageRole, Observation,
    Relation, RelationKey, Session,
};
pub use error::{ExecutionError, KyroMemResult, MemError, SnapshotError, ValidationError};
pub use graph::{GraphEdge, RelationGraph};
pub use merge::{
    ConflictKey, ConflictResolution, FieldConflict, MergeConfig, MergeConflict, MergeConflicts, MergeEngine,
    MergeOutcome, MergeOutcomeKind, MergeRecord, MergeRecordId, MergeStrategy, MergeSummary,
};
pub use replay::{
    Comparison, DiffConfig, DiffEntry, DiffItem, DiffStatus, Judge, JudgeError, Judgement, ReplayConfig,
    ReplayDefaults, ReplayEngine, ScoringEngine, SemanticDiff, SemanticDiffEngine, TimedJudge, Transcript,
    TranscriptTurn,
};
pub use search::{Fusion, HybridSearch, SearchConfig, SearchHit, SearchRequest, SearchResponse, SearchType};
pub use snapshot::{Snapshot, SnapshotEngine, SnapshotId};
pub use storage::{InMemoryStore, StorageError, Store, Transaction};
pub use time::TimeRange;

#[cfg(feature = "persistent")]
pub use storage::persistent::{open_database, PersistentConfig, PersistentStore};
