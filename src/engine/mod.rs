//! The [`KyroMem`] facade.
//!
//! One synchronous entry point over the entity store and every engine built on
//! it (branches, merge, snapshots, graph, search, replay). The root branch is
//! created on first use. Writes take a [`RequestContext`] naming the branch they
//! write to; reads name their branch explicitly.

mod write_path;

/// Bounded worker pools for running operations off the caller's thread.
pub mod runtime;

pub use write_path::EmbeddingPolicy;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::branch::{Branch, BranchManager, CherryPick};
use crate::context::RequestContext;
use crate::embedding::{EmbeddingProvider, LexicalEmbedder, TimedEmbedder};
use crate::entity::{Entity, EntityId, EntityKind};
use crate::error::{KyroMemResult, ValidationError};
use crate::graph::{GraphEdge, RelationGraph};
use crate::merge::{MergeConfig, MergeEngine, MergeOutcome, MergeRecord, MergeRecordId, MergeStrategy};
use crate::replay::{
    Comparison, DiffConfig, DiffItem, Judge, JudgeError, Judgement, ReplayConfig, ReplayDefaults, ReplayEngine,
    ScoringEngine, SemanticDiff, SemanticDiffEngine, TimedJudge, Transcript,
};
use crate::search::{HybridSearch, SearchConfig, SearchRequest, SearchResponse};
use crate::snapshot::{Snapshot, SnapshotEngine, SnapshotId};
use crate::storage::{EntityFilter, InMemoryStore, Store, DEFAULT_MAX_BATCH_OPS};

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Merge tuning.
    pub merge: MergeConfig,
    /// Search tuning.
    pub search: SearchConfig,
    /// Semantic diff thresholds.
    pub diff: DiffConfig,
    /// Replay and judge defaults.
    pub replay: ReplayDefaults,
    /// Cap on operations staged by one transaction.
    pub max_batch_ops: usize,
    /// What a write does when embedding fails.
    pub embedding_policy: EmbeddingPolicy,
    /// Upper bound on an injected embedder's calls, in milliseconds.
    pub embed_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            merge: MergeConfig::default(),
            search: SearchConfig::default(),
            diff: DiffConfig::default(),
            replay: ReplayDefaults::default(),
            max_batch_ops: DEFAULT_MAX_BATCH_OPS,
            embedding_policy: EmbeddingPolicy::default(),
            embed_timeout_ms: Some(10_000),
        }
    }
}

impl EngineConfig {
    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first `ValidationError` found.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.max_batch_ops == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "max_batch_ops must be > 0".to_string(),
            });
        }
        if self.embed_timeout_ms == Some(0) {
            return Err(ValidationError::InvalidConfig {
                reason: "embed_timeout_ms must be > 0".to_string(),
            });
        }
        Ok(Self {
            merge: self.merge.validate()?,
            search: self.search.validate()?,
            diff: self.diff.validate()?,
            replay: self.replay.validate()?,
            ..self
        })
    }
}

/// Versioned, branchable memory for agent context.
pub struct KyroMem {
    store: Arc<dyn Store>,
    config: EngineConfig,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    scoring: Option<ScoringEngine>,
    main_ready: AtomicBool,
    branches: BranchManager,
    merges: MergeEngine,
    snapshots: SnapshotEngine,
    graph: RelationGraph,
    search: HybridSearch,
    replays: ReplayEngine,
    diffs: SemanticDiffEngine,
}

impl std::fmt::Debug for KyroMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KyroMem")
            .field("config", &self.config)
            .field("embedder", &self.embedder.as_ref().map(|e| e.name().to_string()))
            .field("scoring", &self.scoring)
            .finish_non_exhaustive()
    }
}

impl KyroMem {
    /// Engine over `store` with the default configuration and the lexical embedder.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::build(store, EngineConfig::default(), Some(Arc::new(LexicalEmbedder::default())))
    }

    /// Engine over a fresh in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    /// Engine over `store` with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an invalid configuration.
    pub fn with_config(store: Arc<dyn Store>, config: EngineConfig) -> KyroMemResult<Self> {
        let config = config.validate()?;
        Ok(Self::build(store, config, Some(Arc::new(LexicalEmbedder::default()))))
    }

    fn build(store: Arc<dyn Store>, config: EngineConfig, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        let max_ops = config.max_batch_ops;
        Self {
            branches: BranchManager::new(Arc::clone(&store)).with_max_batch_ops(max_ops),
            merges: MergeEngine::new(Arc::clone(&store), config.merge.clone()).with_max_batch_ops(max_ops),
            snapshots: SnapshotEngine::new(Arc::clone(&store)).with_max_batch_ops(max_ops),
            graph: RelationGraph::new(Arc::clone(&store)),
            search: HybridSearch::new(Arc::clone(&store), embedder.clone(), config.search.clone()),
            replays: ReplayEngine::new(Arc::clone(&store), config.replay.clone()),
            diffs: SemanticDiffEngine::new(config.diff),
            scoring: None,
            main_ready: AtomicBool::new(false),
            embedder,
            config,
            store,
        }
    }

    /// Replaces the embedding provider used by writes and search.
    ///
    /// The provider is wrapped in a [`TimedEmbedder`] when `embed_timeout_ms`
    /// is set.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let embedder: Arc<dyn EmbeddingProvider> = match self.config.embed_timeout_ms {
            Some(ms) => Arc::new(TimedEmbedder::new(embedder, Duration::from_millis(ms))),
            None => embedder,
        };
        self.set_embedder(Some(embedder));
        self
    }

    /// Removes the embedding provider: writes store no embeddings and vector
    /// search degrades to text.
    #[must_use]
    pub fn without_embedder(mut self) -> Self {
        self.set_embedder(None);
        self
    }

    fn set_embedder(&mut self, embedder: Option<Arc<dyn EmbeddingProvider>>) {
        self.search = HybridSearch::new(Arc::clone(&self.store), embedder.clone(), self.config.search.clone());
        self.embedder = embedder;
    }

    /// Installs the judge used by [`KyroMem::score`] and [`KyroMem::compare`].
    ///
    /// The judge is wrapped in a [`TimedJudge`] when `judge_timeout_ms` is set.
    #[must_use]
    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        let judge: Arc<dyn Judge> = match self.config.replay.judge_timeout_ms {
            Some(ms) => Arc::new(TimedJudge::new(judge, Duration::from_millis(ms))),
            None => judge,
        };
        self.scoring = Some(ScoringEngine::new(judge));
        self
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ready(&self) -> KyroMemResult<()> {
        if !self.main_ready.load(Ordering::Acquire) {
            self.ensure_main_branch()?;
        }
        Ok(())
    }

    /// Creates `main` if needed. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn ensure_main_branch(&self) -> KyroMemResult<Branch> {
        let main = self.branches.ensure_main_branch()?;
        self.main_ready.store(true, Ordering::Release);
        Ok(main)
    }

    /// Creates `name` under `parent`, copying the parent's entities of `kinds`.
    ///
    /// # Errors
    ///
    /// See [`BranchManager::create_branch`].
    pub fn create_branch(
        &self,
        ctx: &RequestContext,
        name: &str,
        parent: &str,
        kinds: &[EntityKind],
    ) -> KyroMemResult<Branch> {
        self.ready()?;
        self.branches.create_branch(ctx, name, parent, kinds)
    }

    /// Looks up a branch.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` if it does not exist.
    pub fn get_branch(&self, name: &str) -> KyroMemResult<Branch> {
        self.ready()?;
        self.branches.get_branch(name)
    }

    /// All branches ordered by name.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn list_branches(&self) -> KyroMemResult<Vec<Branch>> {
        self.ready()?;
        self.branches.list_branches()
    }

    /// `name` followed by its ancestors up to `main`.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` if `name` does not exist.
    pub fn lineage(&self, name: &str) -> KyroMemResult<Vec<Branch>> {
        self.ready()?;
        self.branches.lineage(name)
    }

    /// Retires a branch.
    ///
    /// # Errors
    ///
    /// See [`BranchManager::delete_branch`].
    pub fn delete_branch(&self, ctx: &RequestContext, name: &str) -> KyroMemResult<Branch> {
        self.ready()?;
        self.branches.delete_branch(ctx, name)
    }

    /// Copies a conversation and its messages onto `target`.
    ///
    /// # Errors
    ///
    /// See [`BranchManager::cherry_pick_conversation`].
    pub fn cherry_pick_conversation(
        &self,
        ctx: &RequestContext,
        conversation_id: EntityId,
        target: &str,
    ) -> KyroMemResult<CherryPick> {
        self.ready()?;
        self.branches.cherry_pick_conversation(ctx, conversation_id, target)
    }

    /// Records a relation on `ctx.branch`.
    ///
    /// # Errors
    ///
    /// See [`RelationGraph::write_relation`].
    pub fn write_relation(
        &self,
        ctx: &RequestContext,
        source: &str,
        target: &str,
        relation_type: &str,
        properties: BTreeMap<String, serde_json::Value>,
        confidence: f32,
    ) -> KyroMemResult<Entity> {
        self.ready()?;
        self.graph
            .write_relation(ctx, source, target, relation_type, properties, confidence)
    }

    /// Bounded BFS over outgoing relation edges.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` for an unknown branch.
    pub fn graph_query(
        &self,
        branch: &str,
        entity: &str,
        relation_type: Option<&str>,
        depth: usize,
    ) -> KyroMemResult<Vec<GraphEdge>> {
        self.ready()?;
        self.graph.graph_query(branch, entity, relation_type, depth)
    }

    /// Direct outgoing edges of `entity`.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` for an unknown branch.
    pub fn neighbors(&self, branch: &str, entity: &str) -> KyroMemResult<Vec<GraphEdge>> {
        self.ready()?;
        self.graph.neighbors(branch, entity)
    }

    /// Text, vector or hybrid search on one branch.
    ///
    /// # Errors
    ///
    /// See [`HybridSearch::search`].
    pub fn search(&self, request: &SearchRequest) -> KyroMemResult<SearchResponse> {
        self.ready()?;
        self.search.search(request)
    }

    /// Merges `source` into `target`.
    ///
    /// # Errors
    ///
    /// See [`MergeEngine::merge`]. Conflicts are not errors; they come back as
    /// [`MergeOutcome::Conflicts`].
    pub fn merge(
        &self,
        ctx: &RequestContext,
        source: &str,
        target: &str,
        strategy: Option<MergeStrategy>,
    ) -> KyroMemResult<MergeOutcome> {
        self.ready()?;
        self.merges.merge(ctx, source, target, strategy)
    }

    /// Merge records involving `branch`, newest first.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` for an unknown branch.
    pub fn merge_history(&self, branch: &str) -> KyroMemResult<Vec<MergeRecord>> {
        self.ready()?;
        self.merges.merge_history(branch)
    }

    /// Fetches one merge record.
    ///
    /// # Errors
    ///
    /// Returns `EntityNotFound` for an unknown id.
    pub fn get_merge_record(&self, id: MergeRecordId) -> KyroMemResult<MergeRecord> {
        self.merges.get_merge_record(id)
    }

    /// Captures the entity set of `branch`.
    ///
    /// # Errors
    ///
    /// See [`SnapshotEngine::create_snapshot`].
    pub fn create_snapshot(&self, ctx: &RequestContext, branch: &str, label: &str) -> KyroMemResult<Snapshot> {
        self.ready()?;
        self.snapshots.create_snapshot(ctx, branch, label)
    }

    /// Fetches a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Snapshot(NotFound)` for an unknown id.
    pub fn get_snapshot(&self, id: SnapshotId) -> KyroMemResult<Snapshot> {
        self.snapshots.get_snapshot(id)
    }

    /// Snapshots of `branch`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` for an unknown branch.
    pub fn list_snapshots(&self, branch: &str) -> KyroMemResult<Vec<Snapshot>> {
        self.ready()?;
        self.snapshots.list_snapshots(branch)
    }

    /// Materializes a snapshot as a new branch.
    ///
    /// # Errors
    ///
    /// See [`SnapshotEngine::restore_snapshot`].
    pub fn restore_snapshot(
        &self,
        ctx: &RequestContext,
        snapshot_id: SnapshotId,
        new_branch: &str,
    ) -> KyroMemResult<Branch> {
        self.ready()?;
        self.snapshots.restore_snapshot(ctx, snapshot_id, new_branch)
    }

    /// Entities of `branch` created at or before `at`.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` for an unknown branch.
    pub fn time_travel_query(&self, at: DateTime<Utc>, branch: &str) -> KyroMemResult<Vec<Entity>> {
        self.ready()?;
        self.snapshots.time_travel_query(at, branch)
    }

    /// [`KyroMem::time_travel_query`] restricted to `kinds`.
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
        self.ready()?;
        self.snapshots.time_travel_query_kinds(at, branch, kinds)
    }

    /// Ordered transcript of a conversation.
    ///
    /// # Errors
    ///
    /// See [`ReplayEngine::replay`].
    pub fn replay(&self, conversation_id: EntityId, config: &ReplayConfig) -> KyroMemResult<Transcript> {
        self.ready()?;
        self.replays.replay(conversation_id, config)
    }

    fn scoring(&self) -> KyroMemResult<&ScoringEngine> {
        self.scoring
            .as_ref()
            .ok_or_else(|| JudgeError::Unavailable("no judge configured".to_string()).into())
    }

    /// Scores a transcript with the configured judge.
    ///
    /// # Errors
    ///
    /// `Judge(Unavailable)` without a judge; otherwise see [`ScoringEngine::score`].
    pub fn score(&self, transcript: &Transcript, reference: Option<&str>) -> KyroMemResult<Judgement> {
        self.scoring()?.score(transcript, reference)
    }

    /// Scores two transcripts and reports the delta.
    ///
    /// # Errors
    ///
    /// See [`KyroMem::score`].
    pub fn compare(
        &self,
        baseline: &Transcript,
        candidate: &Transcript,
        reference: Option<&str>,
    ) -> KyroMemResult<Comparison> {
        self.scoring()?.compare(baseline, candidate, reference)
    }

    /// Semantic diff of two item sets.
    #[must_use]
    pub fn diff(&self, a: &[DiffItem], b: &[DiffItem]) -> SemanticDiff {
        self.diffs.diff(a, b)
    }

    /// Semantic diff of the current entities of two branches.
    ///
    /// Items pair by lineage, so copies of the same logical entity line up.
    /// An empty `kinds` compares every kind.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` for either branch.
    pub fn diff_branches(&self, a: &str, b: &str, kinds: &[EntityKind]) -> KyroMemResult<SemanticDiff> {
        self.ready()?;
        let items_a = self.diff_items(a, kinds)?;
        let items_b = self.diff_items(b, kinds)?;
        let diff = self.diffs.diff(&items_a, &items_b);
        tracing::debug!(a, b, entries = diff.entries.len(), "diffed branches");
        Ok(diff)
    }

    fn diff_items(&self, branch: &str, kinds: &[EntityKind]) -> KyroMemResult<Vec<DiffItem>> {
        self.branches.get_branch(branch)?;
        let filter = if kinds.is_empty() {
            EntityFilter::all()
        } else {
            EntityFilter::all().with_kinds(kinds)
        };
        let entities = self.store.scan_branch(branch, &filter)?;
        let superseded: HashSet<EntityId> = entities.iter().filter_map(|e| e.supersedes).collect();
        Ok(entities
            .iter()
            .filter(|e| !superseded.contains(&e.id))
            .map(DiffItem::from_entity)
            .collect())
    }

    /// Turn-by-turn semantic diff of two transcripts.
    #[must_use]
    pub fn diff_transcripts(&self, a: &Transcript, b: &Transcript) -> SemanticDiff {
        self.diffs.diff_transcripts(a, b)
    }

    /// Rebuilds the store's derived indexes from the entity table.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn rebuild_indexes(&self) -> KyroMemResult<()> {
        self.store.rebuild_indexes()?;
        tracing::info!("rebuilt derived indexes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::MessageRole;
    use crate::error::MemError;

    #[test]
    fn main_branch_is_created_on_first_use() {
        let mem = KyroMem::in_memory();
        let branches = mem.list_branches().unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].name, "main");
        assert_eq!(mem.ensure_main_branch().unwrap().name, "main");
        assert_eq!(mem.list_branches().unwrap().len(), 1);
    }

    #[test]
    fn config_validation_reaches_sections() {
        let mut config = EngineConfig::default();
        config.merge.fact_similarity_threshold = 2.0;
        assert!(KyroMem::with_config(Arc::new(InMemoryStore::new()), config).is_err());

        let config = EngineConfig {
            max_batch_ops: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn score_without_judge_is_unavailable() {
        let mem = KyroMem::in_memory();
        let ctx = RequestContext::main().with_session("s1");
        let conv = mem.start_conversation(&ctx, None, None).unwrap();
        mem.append_message(&ctx, conv.id, MessageRole::User, "hello", None).unwrap();
        let transcript = mem.replay(conv.id, &ReplayConfig::default()).unwrap();

        let err = mem.score(&transcript, None).unwrap_err();
        assert!(matches!(err, MemError::Judge(JudgeError::Unavailable(_))));
    }

    #[test]
    fn diff_branches_pairs_copies_by_lineage() {
        let mem = KyroMem::in_memory();
        let ctx = RequestContext::main();
        mem.write_fact(&ctx, "deploys go to staging", "ops", 0.9).unwrap();
        mem.create_branch(&ctx, "t1", "main", &[EntityKind::Fact]).unwrap();
        mem.write_fact(&ctx.for_branch("t1"), "the cache is redis", "ops", 0.8).unwrap();

        let diff = mem.diff_branches("main", "t1", &[EntityKind::Fact]).unwrap();
        assert_eq!(diff.count(crate::replay::DiffStatus::Identical), 1);
        assert_eq!(diff.count(crate::replay::DiffStatus::Added), 1);
        assert!(mem.diff_branches("main", "nope", &[]).is_err());
    }
}
