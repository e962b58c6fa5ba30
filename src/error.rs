//! Error types for KyroMem.
//!
//! Every layer has its own strongly typed error built with thiserror, and
//! [`MemError`] aggregates them so callers can match on the exact failure.
//! Transport-specific mapping (status codes, exit codes) lives outside the crate.

use std::fmt;

use thiserror::Error;

use crate::embedding::EmbeddingError;
use crate::entity::{EntityId, EntityKind};
use crate::merge::MergeConflicts;
use crate::replay::JudgeError;
use crate::storage::StorageError;

/// Validation errors that occur during input validation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Confidence value {value} is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange {
        value: f32,
    },

    #[error("Invalid branch name '{name}': {reason}")]
    InvalidBranchName {
        name: String,
        reason: String,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: String,
        max_length: usize,
    },

    #[error("Invalid time range: {reason}")]
    InvalidTimeRange {
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        reason: String,
    },
}

/// Execution errors raised by the worker runtime and cooperative cancellation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Queue for '{pool}' pool is full (capacity {capacity})")]
    QueueFull {
        pool: String,
        capacity: usize,
    },

    #[error("Worker pool '{pool}' disconnected")]
    Disconnected {
        pool: String,
    },
}

/// Snapshot capture and decode failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Snapshot {id} is corrupted: expected checksum {expected}, computed {actual}")]
    ChecksumMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Snapshot serialization failed: {0}")]
    Serialization(String),
}

/// Top-level error type for KyroMem.
#[derive(Debug, Error)]
pub enum MemError {
    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    #[error("Branch '{name}' is {status} and cannot be used here")]
    BranchInactive {
        name: String,
        status: crate::branch::BranchStatus,
    },

    #[error("Merge produced {} conflict(s)", .0.conflicts.len())]
    MergeConflict(MergeConflicts),

    #[error("{kind} not found: {id}")]
    EntityNotFound {
        kind: NotFoundKind,
        id: String,
    },

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Judge error: {0}")]
    Judge(#[from] JudgeError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
}

/// Which record an [`MemError::EntityNotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotFoundKind {
    /// An entity of a known kind.
    Entity(EntityKind),
    /// A merge history record.
    MergeRecord,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(kind) => write!(f, "{kind}"),
            Self::MergeRecord => write!(f, "merge record"),
        }
    }
}

impl MemError {
    /// Creates an entity-not-found error for the given kind.
    #[must_use]
    pub fn not_found(kind: EntityKind, id: EntityId) -> Self {
        Self::EntityNotFound {
            kind: NotFoundKind::Entity(kind),
            id: id.to_string(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if the merge stopped on conflicts.
    #[must_use]
    pub const fn is_merge_conflict(&self) -> bool {
        matches!(self, Self::MergeConflict(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => matches!(e, StorageError::WriteConflict { .. }),
            Self::Execution(e) => matches!(e, ExecutionError::Timeout { .. } | ExecutionError::QueueFull { .. }),
            Self::Embedding(e) => e.is_transient(),
            Self::Judge(e) => matches!(e, JudgeError::Timeout { .. } | JudgeError::Unavailable(_)),
            _ => false,
        }
    }
}

/// Result type alias for KyroMem operations.
pub type KyroMemResult<T> = Result<T, MemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_confidence() {
        let err = ValidationError::ConfidenceOutOfRange { value: 1.5 };
        let msg = format!("{err}");
        assert!(msg.contains("1.5"));
        assert!(msg.contains("out of range"));
    }

    #[test]
    fn test_entity_not_found_names_kind() {
        let id = EntityId::new();
        let err = MemError::not_found(EntityKind::Conversation, id);
        let msg = err.to_string();
        assert!(msg.starts_with("conversation not found"));
        assert!(msg.contains(&id.to_string()));
    }

    #[test]
    fn test_merge_record_not_found_display() {
        let err = MemError::EntityNotFound {
            kind: NotFoundKind::MergeRecord,
            id: "m-1".to_string(),
        };
        assert_eq!(err.to_string(), "merge record not found: m-1");
    }

    #[test]
    fn test_execution_error_timeout() {
        let err = ExecutionError::Timeout { duration_ms: 5000 };
        assert!(format!("{err}").contains("5000ms"));
    }

    #[test]
    fn test_mem_error_from_validation() {
        let err: MemError = ValidationError::MissingField {
            field: "text".to_string(),
        }
        .into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_errors() {
        let conflict: MemError = StorageError::WriteConflict {
            branch: "main".to_string(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert!(conflict.is_retryable());

        let timeout: MemError = ExecutionError::Timeout { duration_ms: 10 }.into();
        assert!(timeout.is_retryable());

        let exists = MemError::BranchExists("main".to_string());
        assert!(!exists.is_retryable());
    }
}
