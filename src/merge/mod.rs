//! Branch merging.
//!
//! A merge copies what the source branch learned since its fork point onto the
//! target branch. Candidates are source entities with
//! `created_at >= source.created_at`; each one is
//!
//! - skipped when the target already holds the same lineage with identical
//!   content,
//! - a conflict when it competes with a target entity on an identity key
//!   (relation `(source, target, type)` with different confidence or
//!   properties; a fact whose embedding is a near-duplicate of a target fact
//!   with different text),
//! - otherwise added.
//!
//! Copies are new events on the target: they are stamped with the merge time,
//! offset by a nanosecond per copy so source order survives. Messages joining
//! a conversation the target already has are renumbered after its last turn.
//!
//! Conflicts are settled by a [`MergeStrategy`]. Either the whole merge commits
//! in one transaction (copies, source status change, history record) or only
//! the history record of the aborted attempt is written.

mod conflict;
mod history;

pub use conflict::{ConflictKey, FieldConflict, MergeConflict, MergeConflicts};
pub use history::{ConflictResolution, MergeOutcomeKind, MergeRecord, MergeRecordId};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::branch::{BranchManager, BranchStatus, MAIN_BRANCH};
use crate::context::RequestContext;
use crate::embedding::{cosine_similarity, lexical_embedding};
use crate::entity::{Entity, EntityId, EntityKind, EntityPayload, RelationKey};
use crate::error::{KyroMemResult, MemError, NotFoundKind, ValidationError};
use crate::storage::{EntityFilter, Store, Transaction, WriteOp, DEFAULT_MAX_BATCH_OPS};

use conflict::FieldDiff;

/// How conflicting versions are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Append the source version, superseding the target version.
    TakeSource,
    /// Keep the target version.
    TakeTarget,
    /// Abort on any conflict.
    #[default]
    Manual,
    /// Union non-overlapping fields; abort if both sides set a field differently.
    MergeFields,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TakeSource => write!(f, "take-source"),
            Self::TakeTarget => write!(f, "take-target"),
            Self::Manual => write!(f, "manual"),
            Self::MergeFields => write!(f, "merge-fields"),
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "take-source" => Ok(Self::TakeSource),
            "take-target" => Ok(Self::TakeTarget),
            "manual" => Ok(Self::Manual),
            "merge-fields" => Ok(Self::MergeFields),
            other => Err(ValidationError::InvalidOperation {
                reason: format!("unknown merge strategy '{other}'"),
            }),
        }
    }
}

/// Merge tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Cosine similarity at which two facts with different text compete.
    pub fact_similarity_threshold: f32,
    /// Strategy used when the caller does not pick one.
    pub default_strategy: MergeStrategy,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            fact_similarity_threshold: 0.85,
            default_strategy: MergeStrategy::Manual,
        }
    }
}

impl MergeConfig {
    /// Validates the threshold.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` if the threshold is outside [0, 1].
    pub fn validate(self) -> Result<Self, ValidationError> {
        if !(0.0..=1.0).contains(&self.fact_similarity_threshold) {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "fact_similarity_threshold must be in [0, 1] (got {})",
                    self.fact_similarity_threshold
                ),
            });
        }
        Ok(self)
    }
}

/// What a successful merge did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    /// History record of this merge.
    pub record_id: MergeRecordId,
    /// Branch merged from.
    pub source_branch: String,
    /// Branch merged into.
    pub target_branch: String,
    /// Strategy used.
    pub strategy: MergeStrategy,
    /// Clean or resolved.
    pub outcome: MergeOutcomeKind,
    /// Entities appended to the target.
    pub merged_entities: usize,
    /// Candidates already present on the target.
    pub skipped: usize,
    /// Conflicts settled by the strategy.
    pub resolved_conflicts: usize,
}

/// Result of [`MergeEngine::merge`]: conflicts are a value, not an error.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum MergeOutcome {
    /// The merge committed.
    Merged(MergeSummary),
    /// The merge stopped on conflicts; only its history record was written.
    Conflicts(MergeConflicts),
}

impl MergeOutcome {
    /// Turns unresolved conflicts into `MemError::MergeConflict`.
    ///
    /// # Errors
    ///
    /// Returns `MemError::MergeConflict` with the full conflict list.
    pub fn into_result(self) -> KyroMemResult<MergeSummary> {
        match self {
            Self::Merged(summary) => Ok(summary),
            Self::Conflicts(conflicts) => Err(MemError::MergeConflict(conflicts)),
        }
    }

    /// True if the merge committed.
    #[must_use]
    pub const fn is_merged(&self) -> bool {
        matches!(self, Self::Merged(_))
    }

    /// History record of this attempt.
    #[must_use]
    pub const fn record_id(&self) -> MergeRecordId {
        match self {
            Self::Merged(summary) => summary.record_id,
            Self::Conflicts(conflicts) => conflicts.record_id,
        }
    }
}

enum Decision {
    Skip,
    Add,
    Conflict(MergeConflict),
}

/// Target-side view used to classify candidates.
struct TargetIndex {
    contents: HashMap<EntityId, Vec<EntityPayload>>,
    relations: HashMap<RelationKey, Entity>,
    facts: Vec<(Entity, Vec<f32>)>,
    conversations: HashMap<EntityId, EntityId>,
    next_sequence: HashMap<EntityId, u32>,
}

impl TargetIndex {
    fn build(target: &[Entity]) -> Self {
        let superseded: HashSet<EntityId> = target.iter().filter_map(|e| e.supersedes).collect();
        let mut index = Self {
            contents: HashMap::new(),
            relations: HashMap::new(),
            facts: Vec::new(),
            conversations: HashMap::new(),
            next_sequence: HashMap::new(),
        };
        // `target` is ordered by created_at, so later relations replace earlier ones.
        for entity in target {
            index
                .contents
                .entry(entity.lineage_id())
                .or_default()
                .push(entity.payload.clone());
            if superseded.contains(&entity.id) {
                continue;
            }
            match &entity.payload {
                EntityPayload::Relation(relation) => {
                    index.relations.insert(relation.key(), entity.clone());
                }
                EntityPayload::Fact(_) => {
                    index.facts.push((entity.clone(), fact_vector(entity)));
                }
                EntityPayload::Conversation(_) => {
                    index.conversations.insert(entity.lineage_id(), entity.id);
                }
                EntityPayload::Message(message) => {
                    let next = index.next_sequence.entry(message.conversation_id).or_default();
                    *next = (*next).max(message.sequence + 1);
                }
                _ => {}
            }
        }
        index
    }

    fn already_present(&self, candidate: &Entity) -> bool {
        let Some(payloads) = self.contents.get(&candidate.lineage_id()) else {
            return false;
        };
        // Merged messages are re-pointed and renumbered; the turn itself is immutable.
        candidate.kind() == EntityKind::Message || payloads.iter().any(|p| *p == candidate.payload)
    }
}

/// Merge time for the `n`th copy.
fn copy_stamp(base: DateTime<Utc>, n: usize) -> DateTime<Utc> {
    base + Duration::nanoseconds(i64::try_from(n).unwrap_or(i64::MAX))
}

fn fact_vector(entity: &Entity) -> Vec<f32> {
    match entity.embedding() {
        Some(embedding) if !embedding.is_empty() => embedding.to_vec(),
        _ => lexical_embedding(entity.text().unwrap_or_default()),
    }
}

fn fact_similarity(a: &Entity, a_vec: &[f32], b: &Entity, b_vec: &[f32]) -> f32 {
    if a_vec.len() == b_vec.len() {
        cosine_similarity(a_vec, b_vec)
    } else {
        // Stored embeddings from different models; compare lexically instead.
        cosine_similarity(
            &lexical_embedding(a.text().unwrap_or_default()),
            &lexical_embedding(b.text().unwrap_or_default()),
        )
    }
}

/// Merges branches and keeps their merge history.
pub struct MergeEngine {
    store: Arc<dyn Store>,
    branches: BranchManager,
    config: MergeConfig,
    max_batch_ops: usize,
}

impl fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MergeEngine {
    /// Creates an engine over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: MergeConfig) -> Self {
        Self {
            branches: BranchManager::new(Arc::clone(&store)),
            store,
            config,
            max_batch_ops: DEFAULT_MAX_BATCH_OPS,
        }
    }

    /// Caps the operations a single merge may stage.
    #[must_use]
    pub const fn with_max_batch_ops(mut self, max_batch_ops: usize) -> Self {
        self.max_batch_ops = max_batch_ops;
        self
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merges `source` into `target`.
    ///
    /// `strategy` defaults to [`MergeConfig::default_strategy`]. On success the
    /// source branch is marked merged (`main` keeps its status).
    ///
    /// # Errors
    ///
    /// - `Validation` when `source == target`
    /// - `BranchNotFound` / `BranchInactive` for either branch
    /// - `Storage` (including `WriteConflict` if either branch changed while
    ///   the merge was computed) or `Execution(Cancelled)`
    pub fn merge(
        &self,
        ctx: &RequestContext,
        source: &str,
        target: &str,
        strategy: Option<MergeStrategy>,
    ) -> KyroMemResult<MergeOutcome> {
        let strategy = strategy.unwrap_or(self.config.default_strategy);
        if source == target {
            return Err(ValidationError::InvalidOperation {
                reason: format!("cannot merge branch '{source}' into itself"),
            }
            .into());
        }
        let source_branch = self.branches.usable_branch(source)?;
        self.branches.usable_branch(target)?;

        let mut tx = Transaction::begin(self.store.as_ref(), "merge")
            .with_limit(self.max_batch_ops)
            .with_cancellation(ctx.cancel.clone());
        tx.guard_branch(source)?;
        tx.guard_branch(target)?;

        let candidates = self
            .store
            .scan_branch(source, &EntityFilter::all().since(source_branch.fork_point()))?;
        let target_entities = self.store.scan_branch(target, &EntityFilter::all())?;
        let mut index = TargetIndex::build(&target_entities);

        // Source conversations that already exist on the target (by lineage).
        let mut conversation_map: HashMap<EntityId, EntityId> = HashMap::new();
        let mut renumbered: HashSet<EntityId> = HashSet::new();
        for conv in self
            .store
            .scan_branch(source, &EntityFilter::kind(EntityKind::Conversation))?
        {
            if let Some(target_id) = index.conversations.get(&conv.lineage_id()) {
                conversation_map.insert(conv.id, *target_id);
                renumbered.insert(*target_id);
            }
        }

        let stamp = Utc::now();

        let mut conflicts: Vec<MergeConflict> = Vec::new();
        let mut additions: Vec<Entity> = Vec::new();
        let mut copied: HashMap<EntityId, EntityId> = HashMap::new();
        let mut skipped = 0usize;

        for candidate in &candidates {
            ctx.cancel.check()?;
            match self.classify(candidate, &index)? {
                Decision::Skip => skipped += 1,
                Decision::Conflict(conflict) => conflicts.push(conflict),
                Decision::Add => {
                    let mut copy = candidate.copy_to(target, Some(copy_stamp(stamp, additions.len())));
                    copy.supersedes = candidate.supersedes.and_then(|old| copied.get(&old).copied());
                    if let EntityPayload::Message(message) = &mut copy.payload {
                        if let Some(conv) = conversation_map.get(&message.conversation_id) {
                            message.conversation_id = *conv;
                            if renumbered.contains(conv) {
                                let next = index.next_sequence.entry(*conv).or_default();
                                message.sequence = *next;
                                *next += 1;
                            }
                        }
                    }
                    if candidate.kind() == EntityKind::Conversation {
                        conversation_map.insert(candidate.id, copy.id);
                        index.conversations.insert(candidate.lineage_id(), copy.id);
                    }
                    copied.insert(candidate.id, copy.id);
                    additions.push(copy);
                }
            }
        }

        let (resolutions, resolved) =
            self.resolve(strategy, &conflicts, target, copy_stamp(stamp, additions.len()))?;
        let record_id = MergeRecordId::new();

        let Some(resolved) = resolved else {
            drop(tx);
            return self.abort(ctx, record_id, source, target, strategy, conflicts);
        };

        let outcome = if conflicts.is_empty() {
            MergeOutcomeKind::Clean
        } else {
            MergeOutcomeKind::Resolved
        };
        let resolved_conflicts = conflicts.len();
        let merged_entities = additions.len() + resolved.len();
        for entity in additions.into_iter().chain(resolved) {
            tx.insert_entity(entity)?;
        }
        if source != MAIN_BRANCH {
            tx.stage(WriteOp::SetBranchStatus {
                name: source.to_string(),
                status: BranchStatus::Merged,
            })?;
        }
        tx.stage(WriteOp::InsertMergeRecord(MergeRecord {
            id: record_id,
            source_branch: source.to_string(),
            target_branch: target.to_string(),
            strategy,
            conflicts,
            resolutions,
            outcome,
            merged_entities,
            created_at: Utc::now(),
        }))?;
        tx.commit()?;

        tracing::info!(
            source,
            target,
            %strategy,
            %outcome,
            merged_entities,
            skipped,
            resolved_conflicts,
            "merged branch"
        );
        Ok(MergeOutcome::Merged(MergeSummary {
            record_id,
            source_branch: source.to_string(),
            target_branch: target.to_string(),
            strategy,
            outcome,
            merged_entities,
            skipped,
            resolved_conflicts,
        }))
    }

    fn classify(&self, candidate: &Entity, index: &TargetIndex) -> KyroMemResult<Decision> {
        if index.already_present(candidate) {
            return Ok(Decision::Skip);
        }

        match &candidate.payload {
            EntityPayload::Relation(relation) => {
                let key = relation.key();
                let Some(existing) = index.relations.get(&key) else {
                    return Ok(Decision::Add);
                };
                let Some(current) = existing.as_relation() else {
                    return Ok(Decision::Add);
                };
                if current.confidence == relation.confidence && current.properties == relation.properties {
                    return Ok(Decision::Skip);
                }
                Ok(Decision::Conflict(MergeConflict::between(
                    ConflictKey::Relation(key),
                    candidate,
                    existing,
                    None,
                )?))
            }
            EntityPayload::Fact(fact) => {
                let vector = fact_vector(candidate);
                let best = index
                    .facts
                    .iter()
                    .filter(|(existing, _)| existing.text() != Some(fact.text.as_str()))
                    .map(|(existing, existing_vec)| {
                        (existing, fact_similarity(candidate, &vector, existing, existing_vec))
                    })
                    .filter(|(_, sim)| *sim >= self.config.fact_similarity_threshold)
                    .max_by(|a, b| a.1.total_cmp(&b.1));
                match best {
                    Some((existing, similarity)) => Ok(Decision::Conflict(MergeConflict::between(
                        ConflictKey::Fact {
                            target_lineage: existing.lineage_id(),
                        },
                        candidate,
                        existing,
                        Some(similarity),
                    )?)),
                    None => Ok(Decision::Add),
                }
            }
            _ => Ok(Decision::Add),
        }
    }

    /// Applies the strategy. `None` means the merge must abort.
    fn resolve(
        &self,
        strategy: MergeStrategy,
        conflicts: &[MergeConflict],
        target: &str,
        stamp: DateTime<Utc>,
    ) -> KyroMemResult<(Vec<ConflictResolution>, Option<Vec<Entity>>)> {
        let unresolved = || vec![ConflictResolution::Unresolved; conflicts.len()];
        if conflicts.is_empty() {
            return Ok((Vec::new(), Some(Vec::new())));
        }

        match strategy {
            MergeStrategy::Manual => Ok((unresolved(), None)),
            MergeStrategy::TakeTarget => Ok((vec![ConflictResolution::KeptTarget; conflicts.len()], Some(Vec::new()))),
            MergeStrategy::TakeSource => {
                let mut resolutions = Vec::with_capacity(conflicts.len());
                let mut entities = Vec::with_capacity(conflicts.len());
                for (n, conflict) in conflicts.iter().enumerate() {
                    let mut copy = conflict.source.copy_to(target, Some(copy_stamp(stamp, n)));
                    copy.supersedes = Some(conflict.target.id);
                    resolutions.push(ConflictResolution::TookSource { entity: copy.id });
                    entities.push(copy);
                }
                Ok((resolutions, Some(entities)))
            }
            MergeStrategy::MergeFields => {
                if conflicts.iter().any(|c| !c.fields.is_empty()) {
                    return Ok((unresolved(), None));
                }
                let mut resolutions = Vec::with_capacity(conflicts.len());
                let mut entities = Vec::with_capacity(conflicts.len());
                for (n, conflict) in conflicts.iter().enumerate() {
                    let payload = FieldDiff::compute(&conflict.source.payload, &conflict.target.payload)?.into_payload()?;
                    let mut merged = conflict.source.copy_to(target, Some(copy_stamp(stamp, n)));
                    merged.payload = payload;
                    merged.supersedes = Some(conflict.target.id);
                    resolutions.push(ConflictResolution::MergedFields { entity: merged.id });
                    entities.push(merged);
                }
                Ok((resolutions, Some(entities)))
            }
        }
    }

    fn abort(
        &self,
        ctx: &RequestContext,
        record_id: MergeRecordId,
        source: &str,
        target: &str,
        strategy: MergeStrategy,
        conflicts: Vec<MergeConflict>,
    ) -> KyroMemResult<MergeOutcome> {
        let mut tx = Transaction::begin(self.store.as_ref(), "merge_abort").with_cancellation(ctx.cancel.clone());
        tx.stage(WriteOp::InsertMergeRecord(MergeRecord {
            id: record_id,
            source_branch: source.to_string(),
            target_branch: target.to_string(),
            strategy,
            resolutions: vec![ConflictResolution::Unresolved; conflicts.len()],
            conflicts: conflicts.clone(),
            outcome: MergeOutcomeKind::Aborted,
            merged_entities: 0,
            created_at: Utc::now(),
        }))?;
        tx.commit()?;

        tracing::info!(
            source,
            target,
            %strategy,
            conflicts = conflicts.len(),
            "merge aborted on conflicts"
        );
        Ok(MergeOutcome::Conflicts(MergeConflicts {
            record_id,
            source_branch: source.to_string(),
            target_branch: target.to_string(),
            conflicts,
        }))
    }

    /// Merge records where `branch` was source or target, newest first.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` for an unknown branch.
    pub fn merge_history(&self, branch: &str) -> KyroMemResult<Vec<MergeRecord>> {
        self.branches.get_branch(branch)?;
        let mut records = self.store.merge_records(branch)?;
        records.reverse();
        Ok(records)
    }

    /// Fetches one merge record.
    ///
    /// # Errors
    ///
    /// Returns `EntityNotFound` if no record has that id.
    pub fn get_merge_record(&self, id: MergeRecordId) -> KyroMemResult<MergeRecord> {
        self.store.get_merge_record(id)?.ok_or_else(|| MemError::EntityNotFound {
            kind: NotFoundKind::MergeRecord,
            id: id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Fact, Relation};
    use crate::storage::InMemoryStore;

    struct Fixture {
        store: Arc<dyn Store>,
        branches: BranchManager,
        engine: MergeEngine,
        ctx: RequestContext,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let branches = BranchManager::new(Arc::clone(&store));
        branches.ensure_main_branch().unwrap();
        let engine = MergeEngine::new(Arc::clone(&store), MergeConfig::default());
        Fixture {
            store,
            branches,
            engine,
            ctx: RequestContext::main(),
        }
    }

    impl Fixture {
        fn put(&self, entity: Entity) -> Entity {
            let mut tx = Transaction::begin(self.store.as_ref(), "test");
            tx.insert_entity(entity.clone()).unwrap();
            tx.commit().unwrap();
            entity
        }

        fn relation(&self, branch: &str, confidence: f32) -> Entity {
            self.put(Entity::new(
                branch,
                EntityPayload::Relation(Relation::new("A", "B", "uses", confidence).unwrap()),
            ))
        }

        fn fact(&self, branch: &str, text: &str, embedding: Vec<f32>) -> Entity {
            let mut fact = Fact::new(text, "general", 0.8).unwrap();
            fact.embedding = Some(embedding);
            self.put(Entity::new(branch, EntityPayload::Fact(fact)))
        }

        fn relations_on(&self, branch: &str) -> Vec<Entity> {
            self.store
                .scan_branch(branch, &EntityFilter::kind(EntityKind::Relation))
                .unwrap()
        }
    }

    #[test]
    fn clean_merge_copies_and_marks_source() {
        let fx = fixture();
        fx.branches.create_branch(&fx.ctx, "t1", "main", &[]).unwrap();
        let f1 = fx.fact("t1", "F1", vec![1.0, 0.0]);

        let summary = fx.engine.merge(&fx.ctx, "t1", "main", None).unwrap().into_result().unwrap();
        assert_eq!(summary.outcome, MergeOutcomeKind::Clean);
        assert_eq!(summary.merged_entities, 1);

        let facts = fx.store.scan_branch("main", &EntityFilter::kind(EntityKind::Fact)).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].lineage_id(), f1.id);
        assert_eq!(fx.branches.get_branch("t1").unwrap().status, BranchStatus::Merged);
    }

    #[test]
    fn remerge_skips_present_lineage() {
        let fx = fixture();
        fx.branches.create_branch(&fx.ctx, "t1", "main", &[]).unwrap();
        fx.fact("t1", "F1", vec![1.0, 0.0]);
        fx.engine.merge(&fx.ctx, "t1", "main", None).unwrap().into_result().unwrap();

        let again = fx.engine.merge(&fx.ctx, "t1", "main", None).unwrap().into_result().unwrap();
        assert_eq!(again.merged_entities, 0);
        assert_eq!(again.skipped, 1);
    }

    #[test]
    fn relation_conflict_surfaces_both_versions() {
        let fx = fixture();
        fx.branches.create_branch(&fx.ctx, "t1", "main", &[]).unwrap();
        let target = fx.relation("main", 0.3);
        let source = fx.relation("t1", 0.9);

        let outcome = fx.engine.merge(&fx.ctx, "t1", "main", None).unwrap();
        let MergeOutcome::Conflicts(found) = outcome else {
            panic!("expected conflicts");
        };
        assert_eq!(found.conflicts.len(), 1);
        let conflict = &found.conflicts[0];
        assert_eq!(conflict.source.id, source.id);
        assert_eq!(conflict.target.id, target.id);
        assert_eq!(conflict.fields[0].field, "confidence");

        // Nothing but the history record was written.
        assert_eq!(fx.relations_on("main").len(), 1);
        let history = fx.engine.merge_history("main").unwrap();
        assert_eq!(history[0].outcome, MergeOutcomeKind::Aborted);
        assert_eq!(history[0].conflicts.len(), 1);
        assert_eq!(fx.branches.get_branch("t1").unwrap().status, BranchStatus::Active);
    }

    #[test]
    fn take_source_supersedes_target() {
        let fx = fixture();
        fx.branches.create_branch(&fx.ctx, "t1", "main", &[]).unwrap();
        let target = fx.relation("main", 0.3);
        fx.relation("t1", 0.9);

        let summary = fx
            .engine
            .merge(&fx.ctx, "t1", "main", Some(MergeStrategy::TakeSource))
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(summary.outcome, MergeOutcomeKind::Resolved);

        let relations = fx.relations_on("main");
        let winner = relations.iter().find(|r| r.supersedes == Some(target.id)).unwrap();
        assert!((winner.as_relation().unwrap().confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn take_target_keeps_target() {
        let fx = fixture();
        fx.branches.create_branch(&fx.ctx, "t1", "main", &[]).unwrap();
        fx.relation("main", 0.3);
        fx.relation("t1", 0.9);

        let summary = fx
            .engine
            .merge(&fx.ctx, "t1", "main", Some(MergeStrategy::TakeTarget))
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(summary.merged_entities, 0);
        assert_eq!(fx.relations_on("main").len(), 1);
    }

    #[test]
    fn merge_fields_aborts_on_overlap() {
        let fx = fixture();
        fx.branches.create_branch(&fx.ctx, "t1", "main", &[]).unwrap();
        fx.relation("main", 0.3);
        fx.relation("t1", 0.9);

        let err = fx
            .engine
            .merge(&fx.ctx, "t1", "main", Some(MergeStrategy::MergeFields))
            .unwrap()
            .into_result()
            .unwrap_err();
        assert!(err.is_merge_conflict());
    }

    #[test]
    fn near_duplicate_facts_conflict() {
        let fx = fixture();
        fx.branches.create_branch(&fx.ctx, "t1", "main", &[]).unwrap();
        fx.fact("main", "deploys go to us-east-1", vec![1.0, 0.0, 0.0]);
        fx.fact("t1", "deploys go to eu-west-1", vec![0.95, 0.31, 0.0]);
        fx.fact("t1", "the cache is redis", vec![0.0, 0.0, 1.0]);

        let MergeOutcome::Conflicts(found) = fx.engine.merge(&fx.ctx, "t1", "main", None).unwrap() else {
            panic!("expected conflicts");
        };
        assert_eq!(found.conflicts.len(), 1);
        assert!(matches!(found.conflicts[0].key, ConflictKey::Fact { .. }));
        assert!(found.conflicts[0].similarity.unwrap() >= 0.85);
    }

    #[test]
    fn deleted_or_same_branch_rejected() {
        let fx = fixture();
        fx.branches.create_branch(&fx.ctx, "t1", "main", &[]).unwrap();
        fx.branches.delete_branch(&fx.ctx, "t1").unwrap();
        let err = fx.engine.merge(&fx.ctx, "t1", "main", None).unwrap_err();
        assert!(matches!(err, MemError::BranchInactive { .. }));
        assert!(fx.engine.merge(&fx.ctx, "main", "main", None).unwrap_err().is_validation());
    }

    #[test]
    fn strategy_parses() {
        assert_eq!("merge-fields".parse::<MergeStrategy>().unwrap(), MergeStrategy::MergeFields);
        assert!("ours".parse::<MergeStrategy>().is_err());
        assert_eq!(MergeStrategy::TakeSource.to_string(), "take-source");
    }
}
