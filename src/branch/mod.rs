//! Branch records and name validation.
//!
//! A branch is a named, isolated partition of the entity store. Branches form a
//! tree rooted at [`MAIN_BRANCH`]: every other branch names an existing parent at
//! creation time, so cycles cannot be introduced.

mod manager;

pub use manager::{BranchManager, CherryPick};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Name of the root branch.
pub const MAIN_BRANCH: &str = "main";

/// Maximum branch name length in bytes.
pub const MAX_BRANCH_NAME_LEN: usize = 128;

/// Lifecycle status of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    /// Accepting writes.
    #[default]
    Active,
    /// Merged into another branch; still readable and writable.
    Merged,
    /// Retired; rejects writes, merges and use as a parent.
    Deleted,
}

impl fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Merged => write!(f, "merged"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// A branch registry row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Unique name.
    pub name: String,
    /// Parent branch; `None` only for `main`.
    pub parent_branch: Option<String>,
    /// Lifecycle status.
    pub status: BranchStatus,
    /// Fork point.
    pub created_at: DateTime<Utc>,
}

impl Branch {
    /// Creates the root branch.
    #[must_use]
    pub fn root() -> Self {
        Self {
            name: MAIN_BRANCH.to_string(),
            parent_branch: None,
            status: BranchStatus::Active,
            created_at: Utc::now(),
        }
    }

    /// Creates a child of `parent`, stamped now.
    #[must_use]
    pub fn child(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent_branch: Some(parent.into()),
            status: BranchStatus::Active,
            created_at: Utc::now(),
        }
    }

    /// The timestamp merge candidate selection starts from.
    #[must_use]
    pub const fn fork_point(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True unless the branch was deleted.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.status != BranchStatus::Deleted
    }
}

/// Validates a branch name.
///
/// # Errors
///
/// Returns `ValidationError::InvalidBranchName` for empty or overlong names and
/// names with characters outside `[A-Za-z0-9._/-]`.
pub fn validate_branch_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidBranchName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_BRANCH_NAME_LEN {
        return Err(invalid("name is too long"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
    {
        return Err(invalid("allowed characters are [A-Za-z0-9._/-]"));
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return Err(invalid("empty path segment"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_names() {
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("exp/run-1.2_b").is_ok());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("has space").is_err());
        assert!(validate_branch_name("/lead").is_err());
        assert!(validate_branch_name("a//b").is_err());
        assert!(validate_branch_name(&"x".repeat(MAX_BRANCH_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn root_has_no_parent() {
        let root = Branch::root();
        assert_eq!(root.name, MAIN_BRANCH);
        assert!(root.parent_branch.is_none());
        assert!(root.is_usable());
    }
}
