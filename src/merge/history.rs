//! Merge history records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityId;

use super::{MergeConflict, MergeStrategy};

/// Unique identifier for a merge record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MergeRecordId(Uuid);

impl MergeRecordId {
    /// Creates a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MergeRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MergeRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a merge attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcomeKind {
    /// No conflicts.
    Clean,
    /// Conflicts found and all resolved by the strategy.
    Resolved,
    /// Stopped on conflicts; nothing but this record was written.
    Aborted,
}

impl fmt::Display for MergeOutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "clean"),
            Self::Resolved => write!(f, "resolved"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// What happened to one conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Source version appended to the target, superseding the target version.
    TookSource {
        /// The appended entity.
        entity: EntityId,
    },
    /// Target version kept; source candidate dropped.
    KeptTarget,
    /// Union of both versions appended, superseding the target version.
    MergedFields {
        /// The appended entity.
        entity: EntityId,
    },
    /// Left for the caller.
    Unresolved,
}

/// One row of merge history; written for every attempt, including aborts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    /// Record id.
    pub id: MergeRecordId,
    /// Branch merged from.
    pub source_branch: String,
    /// Branch merged into.
    pub target_branch: String,
    /// Strategy used.
    pub strategy: MergeStrategy,
    /// Every conflict found.
    pub conflicts: Vec<MergeConflict>,
    /// One resolution per conflict, same order.
    pub resolutions: Vec<ConflictResolution>,
    /// How the attempt ended.
    pub outcome: MergeOutcomeKind,
    /// Entities written to the target.
    pub merged_entities: usize,
    /// When the attempt ran.
    pub created_at: DateTime<Utc>,
}

impl MergeRecord {
    /// True if the attempt wrote entities or changed status.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome != MergeOutcomeKind::Aborted
    }
}
