//! Conflict values and payload field diffing.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::{Entity, EntityId, EntityKind, EntityPayload, RelationKey};
use crate::storage::StorageError;

use super::MergeRecordId;

/// Identity a conflict was detected on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictKey {
    /// Same `(source_entity, target_entity, relation_type)` on both branches.
    Relation(RelationKey),
    /// A source fact that near-duplicates the target fact with this lineage.
    Fact {
        /// Lineage id of the competing target fact.
        target_lineage: EntityId,
    },
}

impl fmt::Display for ConflictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relation(key) => write!(f, "relation {key}"),
            Self::Fact { target_lineage } => write!(f, "fact ~{target_lineage}"),
        }
    }
}

/// One payload field both branches set to different values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    /// Field path, e.g. `confidence` or `properties.weight`.
    pub field: String,
    /// Value on the source branch.
    pub source: Value,
    /// Value on the target branch.
    pub target: Value,
}

/// Two competing versions of the same logical entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConflict {
    /// Identity the versions share.
    pub key: ConflictKey,
    /// Entity kind of both versions.
    pub kind: EntityKind,
    /// Version on the source branch.
    pub source: Entity,
    /// Version on the target branch.
    pub target: Entity,
    /// Fields set on both sides with different values.
    pub fields: Vec<FieldConflict>,
    /// Embedding similarity, for fact near-duplicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

impl MergeConflict {
    pub(crate) fn between(
        key: ConflictKey,
        source: &Entity,
        target: &Entity,
        similarity: Option<f32>,
    ) -> Result<Self, StorageError> {
        let diff = FieldDiff::compute(&source.payload, &target.payload)?;
        Ok(Self {
            key,
            kind: source.kind(),
            source: source.clone(),
            target: target.clone(),
            fields: diff.conflicts,
            similarity,
        })
    }
}

/// The conflicts that stopped a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeConflicts {
    /// History record written for the aborted attempt.
    pub record_id: MergeRecordId,
    /// Branch that was being merged.
    pub source_branch: String,
    /// Branch that was being merged into.
    pub target_branch: String,
    /// Every conflict found, in candidate order.
    pub conflicts: Vec<MergeConflict>,
}

/// Field paths whose differences never conflict; the target's value is kept.
const DERIVED_FIELDS: &[&str] = &["embedding"];

/// Flattened field-level comparison of two payloads of the same kind.
///
/// Top-level fields are compared directly; object-valued fields (relation
/// properties, session metadata) are compared one key deeper so disjoint keys
/// merge instead of conflicting. Nulls count as unset.
#[derive(Debug, Default)]
pub(crate) struct FieldDiff {
    pub(crate) merged: BTreeMap<String, Value>,
    pub(crate) conflicts: Vec<FieldConflict>,
}

impl FieldDiff {
    pub(crate) fn compute(source: &EntityPayload, target: &EntityPayload) -> Result<Self, StorageError> {
        let source = flatten(source)?;
        let mut merged = flatten(target)?;
        let mut conflicts = Vec::new();

        for (field, value) in source {
            match merged.get(&field) {
                None => {
                    merged.insert(field, value);
                }
                Some(existing) if *existing == value => {}
                Some(existing) => {
                    if !DERIVED_FIELDS.contains(&field.as_str()) {
                        conflicts.push(FieldConflict {
                            field,
                            source: value,
                            target: existing.clone(),
                        });
                    }
                }
            }
        }

        Ok(Self { merged, conflicts })
    }

    /// Rebuilds a payload from the merged fields.
    pub(crate) fn into_payload(self) -> Result<EntityPayload, StorageError> {
        let mut root = Map::new();
        for (path, value) in self.merged {
            match path.split_once('.') {
                Some((field, key)) => {
                    let slot = root
                        .entry(field.to_string())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(inner) = slot {
                        inner.insert(key.to_string(), value);
                    }
                }
                None => {
                    root.insert(path, value);
                }
            }
        }
        serde_json::from_value(Value::Object(root))
            .map_err(|e| StorageError::SerializationError(format!("merged payload: {e}")))
    }
}

fn flatten(payload: &EntityPayload) -> Result<BTreeMap<String, Value>, StorageError> {
    let value = serde_json::to_value(payload)
        .map_err(|e| StorageError::SerializationError(format!("payload: {e}")))?;
    let Value::Object(fields) = value else {
        return Err(StorageError::SerializationError(
            "payload did not serialize to an object".to_string(),
        ));
    };

    let mut out = BTreeMap::new();
    for (field, value) in fields {
        match value {
            Value::Null => {}
            Value::Object(inner) => {
                for (key, value) in inner {
                    if !value.is_null() {
                        out.insert(format!("{field}.{key}"), value);
                    }
                }
            }
            other => {
                out.insert(field, other);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Relation;
    use serde_json::json;

    fn relation(confidence: f32, props: Value) -> EntityPayload {
        let properties = serde_json::from_value(props).unwrap();
        EntityPayload::Relation(
            Relation::new("A", "B", "uses", confidence)
                .unwrap()
                .with_properties(properties),
        )
    }

    #[test]
    fn disjoint_properties_merge() {
        let diff = FieldDiff::compute(&relation(0.5, json!({"since": 2021})), &relation(0.5, json!({"via": "api"}))).unwrap();
        assert!(diff.conflicts.is_empty());

        let EntityPayload::Relation(merged) = diff.into_payload().unwrap() else {
            panic!("expected relation");
        };
        assert_eq!(merged.properties.len(), 2);
        assert_eq!(merged.properties["since"], json!(2021));
    }

    #[test]
    fn same_field_different_values_conflicts() {
        let diff = FieldDiff::compute(&relation(0.9, json!({"w": 1})), &relation(0.3, json!({"w": 2}))).unwrap();
        let fields: Vec<&str> = diff.conflicts.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["confidence", "properties.w"]);
    }

    #[test]
    fn empty_properties_roundtrip() {
        let diff = FieldDiff::compute(&relation(0.4, json!({})), &relation(0.4, json!({}))).unwrap();
        assert!(matches!(diff.into_payload().unwrap(), EntityPayload::Relation(r) if r.properties.is_empty()));
    }
}
