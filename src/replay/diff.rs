//! Semantic diff between two sets of text items.
//!
//! Items are paired first by key (lineage id for entities, turn index for
//! transcripts). Leftovers are then paired greedily by embedding similarity,
//! best pair first, as long as the similarity reaches `pair_threshold`. Paired
//! items are identical when their text is equal or their similarity reaches
//! `identical_threshold`; otherwise they are modified. Unpaired items are
//! removed (only in A) or added (only in B).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::embedding::{cosine_similarity, lexical_embedding};
use crate::entity::Entity;
use crate::error::ValidationError;

use super::{Transcript, TranscriptTurn};

/// Diff thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Minimum similarity for two unkeyed items to be paired.
    pub pair_threshold: f32,
    /// Similarity at which paired items count as identical.
    pub identical_threshold: f32,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            pair_threshold: 0.75,
            identical_threshold: 0.97,
        }
    }
}

impl DiffConfig {
    /// Validates the thresholds.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` unless
    /// `0 <= pair_threshold <= identical_threshold <= 1`.
    pub fn validate(self) -> Result<Self, ValidationError> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);
        if !in_unit(self.pair_threshold)
            || !in_unit(self.identical_threshold)
            || self.pair_threshold > self.identical_threshold
        {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "diff thresholds must satisfy 0 <= pair ({}) <= identical ({}) <= 1",
                    self.pair_threshold, self.identical_threshold
                ),
            });
        }
        Ok(self)
    }
}

/// One side of a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffItem {
    /// Pairing key.
    pub key: String,
    /// Compared text.
    pub text: String,
    /// Stored embedding; a lexical embedding of `text` is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl DiffItem {
    /// Creates an item without an embedding.
    #[must_use]
    pub fn new(key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            text: text.into(),
            embedding: None,
        }
    }

    /// Keyed by lineage id. Kinds without free text compare by their JSON payload.
    #[must_use]
    pub fn from_entity(entity: &Entity) -> Self {
        let text = entity
            .text()
            .map(str::to_string)
            .or_else(|| serde_json::to_string(&entity.payload).ok())
            .unwrap_or_default();
        Self {
            key: entity.lineage_id().to_string(),
            text,
            embedding: entity.embedding().map(<[f32]>::to_vec),
        }
    }

    /// Keyed by turn position.
    #[must_use]
    pub fn from_turn(index: usize, turn: &TranscriptTurn) -> Self {
        Self::new(format!("turn-{index}"), format!("{}: {}", turn.role, turn.content))
    }

    fn vector(&self) -> Vec<f32> {
        match &self.embedding {
            Some(v) if !v.is_empty() => v.clone(),
            _ => lexical_embedding(&self.text),
        }
    }
}

/// Classification of one diff entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    /// Same content on both sides.
    Identical,
    /// Paired, but the content changed.
    Modified,
    /// Only in B.
    Added,
    /// Only in A.
    Removed,
}

impl fmt::Display for DiffStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identical => write!(f, "identical"),
            Self::Modified => write!(f, "modified"),
            Self::Added => write!(f, "added"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// One line of a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Classification.
    pub status: DiffStatus,
    /// Item from A, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a: Option<DiffItem>,
    /// Item from B, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b: Option<DiffItem>,
    /// Similarity of a paired entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

/// Result of a diff: entries in A order, then additions in B order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticDiff {
    /// All entries.
    pub entries: Vec<DiffEntry>,
}

impl SemanticDiff {
    /// Number of entries with `status`.
    #[must_use]
    pub fn count(&self, status: DiffStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    /// True if every entry is identical.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.entries.iter().all(|e| e.status == DiffStatus::Identical)
    }
}

/// Computes semantic diffs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemanticDiffEngine {
    config: DiffConfig,
}

impl SemanticDiffEngine {
    /// Creates an engine with `config`.
    #[must_use]
    pub const fn new(config: DiffConfig) -> Self {
        Self { config }
    }

    /// Diffs two item sets.
    #[must_use]
    pub fn diff(&self, a: &[DiffItem], b: &[DiffItem]) -> SemanticDiff {
        let mut pair_of_a: Vec<Option<(usize, f32)>> = vec![None; a.len()];
        let mut b_taken = vec![false; b.len()];

        // Pass 1: keys.
        let mut b_by_key: HashMap<&str, usize> = HashMap::new();
        for (j, item) in b.iter().enumerate() {
            b_by_key.entry(item.key.as_str()).or_insert(j);
        }
        for (i, item) in a.iter().enumerate() {
            if let Some(&j) = b_by_key.get(item.key.as_str()) {
                if !b_taken[j] {
                    b_taken[j] = true;
                    pair_of_a[i] = Some((j, similarity(item, &b[j])));
                }
            }
        }

        // Pass 2: greedy by similarity over the leftovers.
        let a_vectors: Vec<Option<Vec<f32>>> = a
            .iter()
            .zip(&pair_of_a)
            .map(|(item, paired)| paired.is_none().then(|| item.vector()))
            .collect();
        let b_vectors: Vec<Option<Vec<f32>>> = b
            .iter()
            .zip(&b_taken)
            .map(|(item, taken)| (!taken).then(|| item.vector()))
            .collect();

        let mut candidates: Vec<(usize, usize, f32)> = Vec::new();
        for (i, av) in a_vectors.iter().enumerate() {
            let Some(av) = av else { continue };
            for (j, bv) in b_vectors.iter().enumerate() {
                let Some(bv) = bv else { continue };
                let sim = vector_similarity(&a[i], av, &b[j], bv);
                if sim >= self.config.pair_threshold {
                    candidates.push((i, j, sim));
                }
            }
        }
        candidates.sort_by(|x, y| y.2.total_cmp(&x.2).then_with(|| x.0.cmp(&y.0)).then_with(|| x.1.cmp(&y.1)));
        for (i, j, sim) in candidates {
            if pair_of_a[i].is_none() && !b_taken[j] {
                pair_of_a[i] = Some((j, sim));
                b_taken[j] = true;
            }
        }

        let mut entries = Vec::with_capacity(a.len() + b.len());
        for (item, paired) in a.iter().zip(pair_of_a) {
            entries.push(match paired {
                Some((j, sim)) => {
                    let identical = item.text == b[j].text || sim >= self.config.identical_threshold;
                    DiffEntry {
                        status: if identical { DiffStatus::Identical } else { DiffStatus::Modified },
                        a: Some(item.clone()),
                        b: Some(b[j].clone()),
                        similarity: Some(sim),
                    }
                }
                None => DiffEntry {
                    status: DiffStatus::Removed,
                    a: Some(item.clone()),
                    b: None,
                    similarity: None,
                },
            });
        }
        for (item, taken) in b.iter().zip(b_taken) {
            if !taken {
                entries.push(DiffEntry {
                    status: DiffStatus::Added,
                    a: None,
                    b: Some(item.clone()),
                    similarity: None,
                });
            }
        }
        SemanticDiff { entries }
    }

    /// Diffs two transcripts turn by turn.
    #[must_use]
    pub fn diff_transcripts(&self, a: &Transcript, b: &Transcript) -> SemanticDiff {
        let items = |t: &Transcript| -> Vec<DiffItem> {
            t.turns.iter().enumerate().map(|(i, turn)| DiffItem::from_turn(i, turn)).collect()
        };
        self.diff(&items(a), &items(b))
    }
}

fn similarity(a: &DiffItem, b: &DiffItem) -> f32 {
    if a.text == b.text {
        return 1.0;
    }
    vector_similarity(a, &a.vector(), b, &b.vector())
}

fn vector_similarity(a: &DiffItem, av: &[f32], b: &DiffItem, bv: &[f32]) -> f32 {
    if av.len() == bv.len() {
        cosine_similarity(av, bv)
    } else {
        cosine_similarity(&lexical_embedding(&a.text), &lexical_embedding(&b.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SemanticDiffEngine {
        SemanticDiffEngine::new(DiffConfig::default())
    }

    #[test]
    fn keyed_items_pair_regardless_of_text() {
        let a = vec![DiffItem::new("k1", "deploy to staging"), DiffItem::new("k2", "cache is redis")];
        let b = vec![DiffItem::new("k1", "deploy to staging"), DiffItem::new("k2", "lunch at noon")];
        let diff = engine().diff(&a, &b);
        assert_eq!(diff.entries[0].status, DiffStatus::Identical);
        assert_eq!(diff.entries[1].status, DiffStatus::Modified);
        assert!(!diff.is_unchanged());
    }

    #[test]
    fn similar_unkeyed_items_pair_and_others_are_added_or_removed() {
        let mut near_a = DiffItem::new("a1", "deploys go to us-east-1");
        near_a.embedding = Some(vec![1.0, 0.0, 0.0]);
        let mut near_b = DiffItem::new("b1", "deploys go to eu-west-1");
        near_b.embedding = Some(vec![0.95, 0.31, 0.0]);
        let mut gone = DiffItem::new("a2", "old note");
        gone.embedding = Some(vec![0.0, 1.0, 0.0]);
        let mut fresh = DiffItem::new("b2", "new note");
        fresh.embedding = Some(vec![0.0, 0.0, 1.0]);

        let diff = engine().diff(&[near_a, gone], &[near_b, fresh]);
        assert_eq!(diff.entries.len(), 3);
        assert_eq!(diff.entries[0].status, DiffStatus::Modified);
        assert_eq!(diff.entries[1].status, DiffStatus::Removed);
        assert_eq!(diff.entries[2].status, DiffStatus::Added);
        assert_eq!(diff.count(DiffStatus::Added), 1);
    }

    #[test]
    fn identical_sets_are_unchanged() {
        let items = vec![DiffItem::new("x", "same"), DiffItem::new("y", "also same")];
        assert!(engine().diff(&items, &items).is_unchanged());
        assert!(engine().diff(&[], &[]).is_unchanged());
    }

    #[test]
    fn config_validation() {
        assert!(DiffConfig {
            pair_threshold: 0.9,
            identical_threshold: 0.5
        }
        .validate()
        .is_err());
        assert!(DiffConfig::default().validate().is_ok());
    }
}
