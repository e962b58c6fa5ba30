//! Relation graph over a branch.
//!
//! Relations are edges `source_entity -[relation_type]-> target_entity` between
//! named nodes. Only relations on the queried branch are edges, and for each
//! `(source, target, type)` key only the current version counts: the most
//! recent relation that no later relation supersedes.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::branch::BranchManager;
use crate::context::RequestContext;
use crate::entity::{Entity, EntityId, EntityKind, EntityPayload, Relation, RelationKey};
use crate::error::KyroMemResult;
use crate::storage::{EntityFilter, Store, Transaction};

/// One traversed edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Edge tail.
    pub source: String,
    /// Edge head.
    pub target: String,
    /// Edge label.
    pub relation_type: String,
    /// Confidence of the current relation version.
    pub confidence: f32,
    /// Id of the relation entity backing the edge.
    pub relation_id: EntityId,
}

impl GraphEdge {
    fn from_entity(entity: &Entity, relation: &Relation) -> Self {
        Self {
            source: relation.source_entity.clone(),
            target: relation.target_entity.clone(),
            relation_type: relation.relation_type.clone(),
            confidence: relation.confidence,
            relation_id: entity.id,
        }
    }

    /// Identity key of the edge.
    #[must_use]
    pub fn key(&self) -> RelationKey {
        RelationKey {
            source_entity: self.source.clone(),
            target_entity: self.target.clone(),
            relation_type: self.relation_type.clone(),
        }
    }
}

/// Writes relations and runs bounded traversals.
pub struct RelationGraph {
    store: Arc<dyn Store>,
    branches: BranchManager,
}

impl std::fmt::Debug for RelationGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationGraph").finish_non_exhaustive()
    }
}

impl RelationGraph {
    /// Creates a graph engine over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            branches: BranchManager::new(Arc::clone(&store)),
            store,
        }
    }

    /// Records a relation on `ctx.branch`.
    ///
    /// # Errors
    ///
    /// - `Validation` for empty endpoints/type or confidence outside [0, 1]
    /// - `BranchNotFound` / `BranchInactive` for the branch
    pub fn write_relation(
        &self,
        ctx: &RequestContext,
        source: &str,
        target: &str,
        relation_type: &str,
        properties: BTreeMap<String, serde_json::Value>,
        confidence: f32,
    ) -> KyroMemResult<Entity> {
        let relation = Relation::new(source, target, relation_type, confidence)?.with_properties(properties);
        self.branches.usable_branch(&ctx.branch)?;

        let entity = Entity::new(ctx.branch.clone(), EntityPayload::Relation(relation));
        let mut tx = Transaction::begin(self.store.as_ref(), "write_relation").with_cancellation(ctx.cancel.clone());
        tx.insert_entity(entity.clone())?;
        tx.commit()?;

        tracing::debug!(branch = %ctx.branch, source, target, relation_type, "wrote relation");
        Ok(entity)
    }

    /// Current edges of `branch`, grouped by tail, each list in creation order.
    fn adjacency(&self, branch: &str) -> KyroMemResult<HashMap<String, Vec<GraphEdge>>> {
        let relations = self.store.scan_branch(branch, &EntityFilter::kind(EntityKind::Relation))?;
        let superseded: HashSet<EntityId> = relations.iter().filter_map(|e| e.supersedes).collect();

        // Scan order is (created_at, id): the last live version per key wins.
        let mut current: HashMap<RelationKey, &Entity> = HashMap::new();
        for entity in relations.iter().filter(|e| !superseded.contains(&e.id)) {
            if let Some(relation) = entity.as_relation() {
                current.insert(relation.key(), entity);
            }
        }

        let mut live: Vec<&Entity> = current.into_values().collect();
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut adjacency: HashMap<String, Vec<GraphEdge>> = HashMap::new();
        for entity in live {
            if let Some(relation) = entity.as_relation() {
                adjacency
                    .entry(relation.source_entity.clone())
                    .or_default()
                    .push(GraphEdge::from_entity(entity, relation));
            }
        }
        Ok(adjacency)
    }

    /// Breadth-first traversal of outgoing edges from `entity`, at most `depth`
    /// hops, optionally following only `relation_type` edges.
    ///
    /// Returns edges in discovery order without duplicates. Cycles terminate
    /// because each node is expanded once; `depth == 0` yields no edges.
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
        self.branches.get_branch(branch)?;
        if depth == 0 {
            return Ok(Vec::new());
        }
        let adjacency = self.adjacency(branch)?;

        let mut edges = Vec::new();
        let mut seen_edges: HashSet<RelationKey> = HashSet::new();
        let mut expanded: HashSet<&str> = HashSet::from([entity]);
        let mut queue: VecDeque<(&str, usize)> = VecDeque::from([(entity, 0)]);

        while let Some((node, level)) = queue.pop_front() {
            if level >= depth {
                continue;
            }
            let Some(outgoing) = adjacency.get(node) else {
                continue;
            };
            for edge in outgoing {
                if relation_type.is_some_and(|t| t != edge.relation_type) {
                    continue;
                }
                if seen_edges.insert(edge.key()) {
                    edges.push(edge.clone());
                }
                if expanded.insert(edge.target.as_str()) {
                    queue.push_back((edge.target.as_str(), level + 1));
                }
            }
        }

        tracing::debug!(branch, entity, depth, edges = edges.len(), "graph query");
        Ok(edges)
    }

    /// Direct outgoing edges of `entity`.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` for an unknown branch.
    pub fn neighbors(&self, branch: &str, entity: &str) -> KyroMemResult<Vec<GraphEdge>> {
        self.graph_query(branch, entity, None, 1)
    }
}
