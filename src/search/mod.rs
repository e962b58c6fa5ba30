//! Hybrid retrieval over one branch.
//!
//! Candidates are the searchable entities (facts, observations, messages) of a
//! branch, narrowed by category and a half-open creation-time window. Entities
//! replaced by a merge are not candidates. Each candidate can be scored by two
//! channels:
//!
//! - text: BM25 from the store's derived full-text index
//! - vector: cosine similarity between the query embedding and the stored
//!   embedding
//!
//! Hybrid search fuses both (see [`Fusion`]). When no embedding provider is
//! configured or it fails, vector and hybrid requests fall back to text-only
//! ranking and the response is marked `degraded`. Ordering is total: score
//! descending, then `created_at` descending, then id.

mod fusion;

pub use fusion::{Fusion, DEFAULT_RRF_K};

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::branch::BranchManager;
use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::entity::{Entity, EntityId, EntityKind};
use crate::error::{KyroMemResult, ValidationError};
use crate::storage::{EntityFilter, Store};
use crate::time::TimeRange;

const SEARCHABLE: [EntityKind; 3] = [EntityKind::Fact, EntityKind::Observation, EntityKind::Message];

/// Which channels rank the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    /// BM25 only.
    Text,
    /// Embedding similarity only.
    Vector,
    /// Both, fused.
    #[default]
    Hybrid,
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Vector => write!(f, "vector"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Search tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// How hybrid results are fused.
    pub fusion: Fusion,
    /// Result count when a request does not set one.
    pub default_limit: usize,
    /// Upper bound on any request's limit.
    pub max_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            fusion: Fusion::default(),
            default_limit: 10,
            max_limit: 1000,
        }
    }
}

impl SearchConfig {
    /// Validates limits and fusion parameters.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for zero or inverted limits or
    /// invalid fusion parameters.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.default_limit == 0 || self.max_limit == 0 || self.default_limit > self.max_limit {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "search limits must satisfy 0 < default_limit <= max_limit (got {} / {})",
                    self.default_limit, self.max_limit
                ),
            });
        }
        self.fusion.validate()?;
        Ok(self)
    }
}

/// One search request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Query text.
    pub query: String,
    /// Ranking mode.
    #[serde(default)]
    pub search_type: SearchType,
    /// Branch to search.
    pub branch: String,
    /// Only facts and observations of this category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Maximum hits; the configured default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Only entities created inside this window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
}

impl SearchRequest {
    /// Hybrid search for `query` on `branch`.
    #[must_use]
    pub fn new(query: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            search_type: SearchType::Hybrid,
            branch: branch.into(),
            category: None,
            limit: None,
            time_range: None,
        }
    }

    /// Sets the ranking mode.
    #[must_use]
    pub const fn with_type(mut self, search_type: SearchType) -> Self {
        self.search_type = search_type;
        self
    }

    /// Restricts to a category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Sets the result limit.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Restricts to a creation-time window.
    #[must_use]
    pub const fn within(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }
}

/// One ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// The matched entity.
    pub entity: Entity,
    /// Score the ranking used.
    pub score: f32,
    /// BM25 score, when the text channel ran and matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_score: Option<f32>,
    /// Cosine similarity, when the vector channel ran and matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f32>,
}

/// Ranked results plus how they were produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Hits, best first.
    pub hits: Vec<SearchHit>,
    /// True if a vector or hybrid request fell back to text-only ranking.
    pub degraded: bool,
    /// Mode that actually ranked the hits.
    pub mode: SearchType,
}

/// Hybrid search engine.
pub struct HybridSearch {
    store: Arc<dyn Store>,
    branches: BranchManager,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: SearchConfig,
}

impl fmt::Debug for HybridSearch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridSearch")
            .field("embedder", &self.embedder.as_ref().map(|e| e.name().to_string()))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HybridSearch {
    /// Creates a search engine; without an embedder every request is text-only.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, embedder: Option<Arc<dyn EmbeddingProvider>>, config: SearchConfig) -> Self {
        Self {
            branches: BranchManager::new(Arc::clone(&store)),
            store,
            embedder,
            config,
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Runs a search.
    ///
    /// # Errors
    ///
    /// - `Validation` for an empty query, a zero limit or a limit above
    ///   `max_limit`
    /// - `BranchNotFound` for an unknown branch
    /// - `Storage` on read failures
    ///
    /// Embedding failures never fail a search; they degrade it.
    pub fn search(&self, request: &SearchRequest) -> KyroMemResult<SearchResponse> {
        let limit = self.check(request)?;
        self.branches.get_branch(&request.branch)?;

        let candidates = self.candidates(request)?;
        if candidates.is_empty() {
            return Ok(SearchResponse {
                hits: Vec::new(),
                degraded: false,
                mode: request.search_type,
            });
        }

        let query_vector = match request.search_type {
            SearchType::Text => None,
            SearchType::Vector | SearchType::Hybrid => self.embed_query(&request.query),
        };
        let degraded = request.search_type != SearchType::Text && query_vector.is_none();
        let mode = if degraded { SearchType::Text } else { request.search_type };

        let text = if mode == SearchType::Vector {
            Vec::new()
        } else {
            self.text_ranking(request, &candidates)?
        };
        let vector = query_vector
            .as_deref()
            .map(|q| vector_ranking(q, &candidates))
            .unwrap_or_default();

        let scores: HashMap<EntityId, f32> = match mode {
            SearchType::Text => text.iter().copied().collect(),
            SearchType::Vector => vector.iter().copied().collect(),
            SearchType::Hybrid => self.config.fusion.fuse(&text, &vector),
        };
        let text_scores: HashMap<EntityId, f32> = text.into_iter().collect();
        let vector_scores: HashMap<EntityId, f32> = vector.into_iter().collect();

        let mut hits: Vec<SearchHit> = scores
            .into_iter()
            .filter_map(|(id, score)| {
                candidates.get(&id).map(|entity| SearchHit {
                    entity: (*entity).clone(),
                    score,
                    text_score: text_scores.get(&id).copied(),
                    vector_score: vector_scores.get(&id).copied(),
                })
            })
            .collect();
        hits.sort_by(rank_order);
        hits.truncate(limit);

        tracing::debug!(
            branch = %request.branch,
            %mode,
            degraded,
            hits = hits.len(),
            "search"
        );
        Ok(SearchResponse { hits, degraded, mode })
    }

    fn check(&self, request: &SearchRequest) -> Result<usize, ValidationError> {
        if request.query.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "query".to_string(),
            });
        }
        let limit = request.limit.unwrap_or(self.config.default_limit);
        if limit == 0 || limit > self.config.max_limit {
            return Err(ValidationError::InvalidOperation {
                reason: format!("limit must be in 1..={} (got {limit})", self.config.max_limit),
            });
        }
        Ok(limit)
    }

    /// Current searchable entities of the branch passing the request filters.
    fn candidates(&self, request: &SearchRequest) -> KyroMemResult<HashMap<EntityId, Entity>> {
        let mut filter = EntityFilter::all().with_kinds(&SEARCHABLE);
        if let Some(category) = &request.category {
            filter = filter.with_category(category.clone());
        }
        if let Some(range) = &request.time_range {
            filter = filter.since(range.from);
        }

        let entities = self.store.scan_branch(&request.branch, &filter)?;
        let superseded: HashSet<EntityId> = entities.iter().filter_map(|e| e.supersedes).collect();
        Ok(entities
            .into_iter()
            .filter(|e| !superseded.contains(&e.id))
            .filter(|e| request.time_range.map_or(true, |r| r.contains(e.created_at)))
            .map(|e| (e.id, e))
            .collect())
    }

    fn text_ranking(
        &self,
        request: &SearchRequest,
        candidates: &HashMap<EntityId, Entity>,
    ) -> KyroMemResult<Vec<(EntityId, f32)>> {
        let mut ranked = self.store.text_search(&request.branch, &request.query)?;
        ranked.retain(|(id, _)| candidates.contains_key(id));
        Ok(ranked)
    }

    fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let Some(embedder) = &self.embedder else {
            tracing::warn!("no embedding provider configured; search degraded to text-only");
            return None;
        };
        match embedder.embed(query) {
            Ok(vector) if !vector.is_empty() => Some(vector),
            Ok(_) => {
                tracing::warn!(provider = embedder.name(), "empty query embedding; search degraded to text-only");
                None
            }
            Err(err) => {
                tracing::warn!(provider = embedder.name(), error = %err, "query embedding failed; search degraded to text-only");
                None
            }
        }
    }
}

/// Candidates with a stored embedding, by positive cosine similarity, best first.
fn vector_ranking(query: &[f32], candidates: &HashMap<EntityId, Entity>) -> Vec<(EntityId, f32)> {
    let mut ranked: Vec<(EntityId, f32)> = candidates
        .values()
        .filter_map(|entity| {
            let similarity = cosine_similarity(query, entity.embedding()?);
            (similarity > 0.0).then_some((entity.id, similarity))
        })
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

fn rank_order(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.entity.created_at.cmp(&a.entity.created_at))
        .then_with(|| a.entity.id.cmp(&b.entity.id))
}
