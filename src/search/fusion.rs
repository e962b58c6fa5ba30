//! Score fusion for hybrid retrieval.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::error::ValidationError;

/// Default reciprocal-rank-fusion constant.
pub const DEFAULT_RRF_K: u32 = 60;

/// How text and vector rankings are combined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Fusion {
    /// Reciprocal-rank fusion: `sum(1 / (k + rank))` over the rankings an item
    /// appears in, with 1-based ranks.
    Rrf {
        /// Rank constant.
        k: u32,
    },
    /// Weighted sum of max-normalized scores.
    Weighted {
        /// Weight of the BM25 channel.
        text_weight: f32,
        /// Weight of the cosine channel.
        vector_weight: f32,
    },
}

impl Default for Fusion {
    fn default() -> Self {
        Self::Rrf { k: DEFAULT_RRF_K }
    }
}

impl Fusion {
    /// Validates the fusion parameters.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for `k == 0` or for negative,
    /// non-finite or all-zero weights.
    pub fn validate(self) -> Result<Self, ValidationError> {
        match self {
            Self::Rrf { k: 0 } => Err(ValidationError::InvalidConfig {
                reason: "rrf k must be > 0".to_string(),
            }),
            Self::Rrf { .. } => Ok(self),
            Self::Weighted {
                text_weight,
                vector_weight,
            } => {
                let valid = |w: f32| w.is_finite() && w >= 0.0;
                if !valid(text_weight) || !valid(vector_weight) || text_weight + vector_weight <= 0.0 {
                    return Err(ValidationError::InvalidConfig {
                        reason: format!(
                            "fusion weights must be finite, non-negative and not both zero (got {text_weight}, {vector_weight})"
                        ),
                    });
                }
                Ok(self)
            }
        }
    }

    /// Combines two rankings, each sorted best first.
    pub(crate) fn fuse(self, text: &[(EntityId, f32)], vector: &[(EntityId, f32)]) -> HashMap<EntityId, f32> {
        let mut fused: HashMap<EntityId, f32> = HashMap::with_capacity(text.len() + vector.len());
        match self {
            Self::Rrf { k } => {
                #[allow(clippy::cast_precision_loss)]
                let k = k as f32;
                for ranking in [text, vector] {
                    for (rank, (id, _)) in ranking.iter().enumerate() {
                        #[allow(clippy::cast_precision_loss)]
                        let contribution = 1.0 / (k + (rank + 1) as f32);
                        *fused.entry(*id).or_insert(0.0) += contribution;
                    }
                }
            }
            Self::Weighted {
                text_weight,
                vector_weight,
            } => {
                for (ranking, weight) in [(text, text_weight), (vector, vector_weight)] {
                    let max = ranking.iter().map(|(_, s)| *s).fold(0.0f32, f32::max);
                    for (id, score) in ranking {
                        let normalized = if max > 0.0 { score / max } else { 0.0 };
                        *fused.entry(*id).or_insert(0.0) += weight * normalized;
                    }
                }
            }
        }
        fused
    }
}
