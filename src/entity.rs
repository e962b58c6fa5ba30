//! Entity types and the shared envelope.
//!
//! Every record KyroMem stores (facts, observations, relations, messages,
//! conversations, sessions) is an [`Entity`]: a common envelope carrying
//! identity, branch scope and creation time, plus a kind-specific
//! [`EntityPayload`]. Entities are append-only. Once committed they are never
//! updated or deleted, which is what makes time-travel reconstruction a plain
//! creation-time filter.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Maximum length of free-text fields (fact text, message content).
pub const MAX_TEXT_LEN: usize = 64 * 1024;

/// Globally unique, immutable entity identifier.
///
/// # Examples
///
/// ```
/// use kyromem::EntityId;
///
/// let id = EntityId::new();
/// assert!(!id.is_nil());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Creates a new random entity ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an entity ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns true if this is a nil (all zeros) UUID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// The closed set of entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A standalone piece of knowledge.
    Fact,
    /// Something the agent observed.
    Observation,
    /// A directed, labeled edge between two named entities.
    Relation,
    /// One turn of a conversation.
    Message,
    /// An ordered group of messages.
    Conversation,
    /// An agent session.
    Session,
}

impl EntityKind {
    /// All kinds, in copy order (conversations before their messages).
    pub const ALL: [Self; 6] = [
        Self::Session,
        Self::Conversation,
        Self::Message,
        Self::Fact,
        Self::Observation,
        Self::Relation,
    ];

    /// Kinds that carry free text and participate in search.
    #[must_use]
    pub const fn is_searchable(self) -> bool {
        matches!(self, Self::Fact | Self::Observation | Self::Message)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fact => write!(f, "fact"),
            Self::Observation => write!(f, "observation"),
            Self::Relation => write!(f, "relation"),
            Self::Message => write!(f, "message"),
            Self::Conversation => write!(f, "conversation"),
            Self::Session => write!(f, "session"),
        }
    }
}

fn check_confidence(value: f32) -> Result<f32, ValidationError> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return Err(ValidationError::ConfidenceOutOfRange { value });
    }
    Ok(value)
}

fn check_text(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: field.to_string(),
        });
    }
    if value.len() > MAX_TEXT_LEN {
        return Err(ValidationError::FieldTooLong {
            field: field.to_string(),
            max_length: MAX_TEXT_LEN,
        });
    }
    Ok(())
}

/// A piece of knowledge the agent holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// The fact itself.
    pub text: String,
    /// Free-form grouping used for filtering.
    pub category: String,
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// Optional embedding of `text`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Fact {
    /// Creates a fact with no embedding.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for empty text or out-of-range confidence.
    pub fn new(
        text: impl Into<String>,
        category: impl Into<String>,
        confidence: f32,
    ) -> Result<Self, ValidationError> {
        let text = text.into();
        check_text("text", &text)?;
        Ok(Self {
            text,
            category: category.into(),
            confidence: check_confidence(confidence)?,
            embedding: None,
        })
    }
}

/// Something the agent observed in its environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Observed content.
    pub content: String,
    /// Where the observation came from (tool name, sensor, URL).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Free-form grouping used for filtering.
    pub category: String,
    /// Optional embedding of `content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Observation {
    /// Creates an observation.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingField` for empty content.
    pub fn new(content: impl Into<String>, category: impl Into<String>) -> Result<Self, ValidationError> {
        let content = content.into();
        check_text("content", &content)?;
        Ok(Self {
            content,
            source: None,
            category: category.into(),
            embedding: None,
        })
    }
}

/// A directed labeled edge `source_entity -[relation_type]-> target_entity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// Edge tail.
    pub source_entity: String,
    /// Edge head.
    pub target_entity: String,
    /// Edge label.
    pub relation_type: String,
    /// Arbitrary edge attributes.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Confidence in [0, 1].
    pub confidence: f32,
}

impl Relation {
    /// Creates a relation with no properties.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for empty endpoints/type or out-of-range confidence.
    pub fn new(
        source_entity: impl Into<String>,
        target_entity: impl Into<String>,
        relation_type: impl Into<String>,
        confidence: f32,
    ) -> Result<Self, ValidationError> {
        let source_entity = source_entity.into();
        let target_entity = target_entity.into();
        let relation_type = relation_type.into();
        check_text("source_entity", &source_entity)?;
        check_text("target_entity", &target_entity)?;
        check_text("relation_type", &relation_type)?;
        Ok(Self {
            source_entity,
            target_entity,
            relation_type,
            properties: BTreeMap::new(),
            confidence: check_confidence(confidence)?,
        })
    }

    /// Adds properties to the relation.
    #[must_use]
    pub fn with_properties(mut self, properties: BTreeMap<String, serde_json::Value>) -> Self {
        self.properties = properties;
        self
    }

    /// Identity key used for merge conflict detection and edge dedup.
    #[must_use]
    pub fn key(&self) -> RelationKey {
        RelationKey {
            source_entity: self.source_entity.clone(),
            target_entity: self.target_entity.clone(),
            relation_type: self.relation_type.clone(),
        }
    }
}

/// `(source_entity, target_entity, relation_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationKey {
    /// Edge tail.
    pub source_entity: String,
    /// Edge head.
    pub target_entity: String,
    /// Edge label.
    pub relation_type: String,
}

impl fmt::Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -[{}]-> {}",
            self.source_entity, self.relation_type, self.target_entity
        )
    }
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// End user.
    User,
    /// The agent.
    Assistant,
    /// Tool output.
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Owning conversation.
    pub conversation_id: EntityId,
    /// Position within the conversation, starting at 0.
    pub sequence: u32,
    /// Author role.
    pub role: MessageRole,
    /// Message body.
    pub content: String,
    /// Tool calls issued in this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
}

/// An ordered sequence of messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Session the conversation belongs to.
    pub session_id: String,
    /// Agent that took part.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Task the conversation worked on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Human-readable title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// An agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// External session identifier.
    pub session_id: String,
    /// Agent running the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Arbitrary session attributes.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Kind-specific entity content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityPayload {
    /// A fact.
    Fact(Fact),
    /// An observation.
    Observation(Observation),
    /// A relation.
    Relation(Relation),
    /// A message.
    Message(Message),
    /// A conversation header.
    Conversation(Conversation),
    /// A session header.
    Session(Session),
}

impl EntityPayload {
    /// Returns the kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Fact(_) => EntityKind::Fact,
            Self::Observation(_) => EntityKind::Observation,
            Self::Relation(_) => EntityKind::Relation,
            Self::Message(_) => EntityKind::Message,
            Self::Conversation(_) => EntityKind::Conversation,
            Self::Session(_) => EntityKind::Session,
        }
    }
}

/// Shared envelope every entity exposes.
///
/// Traversal, search and time-travel code works against this trait; code that
/// needs kind-specific fields matches on [`EntityPayload`].
pub trait Envelope {
    /// Globally unique id.
    fn id(&self) -> EntityId;
    /// Branch the record is scoped to.
    fn branch_name(&self) -> &str;
    /// Immutable creation timestamp.
    fn created_at(&self) -> DateTime<Utc>;
    /// Kind tag.
    fn kind(&self) -> EntityKind;
}

/// A stored, immutable, branch-scoped record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Globally unique id.
    pub id: EntityId,
    /// Branch this entity belongs to.
    pub branch_name: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Root entity this one was copied from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<EntityId>,
    /// Entity on the same branch that this one replaces (merge take-source).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<EntityId>,
    /// Kind-specific content.
    pub payload: EntityPayload,
}

impl Envelope for Entity {
    fn id(&self) -> EntityId {
        self.id
    }

    fn branch_name(&self) -> &str {
        &self.branch_name
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn kind(&self) -> EntityKind {
        self.payload.kind()
    }
}

impl Entity {
    /// Creates a new entity on `branch_name`, stamped now.
    #[must_use]
    pub fn new(branch_name: impl Into<String>, payload: EntityPayload) -> Self {
        Self::new_at(branch_name, payload, Utc::now())
    }

    /// Creates a new entity with an explicit creation time.
    #[must_use]
    pub fn new_at(branch_name: impl Into<String>, payload: EntityPayload, created_at: DateTime<Utc>) -> Self {
        Self {
            id: EntityId::new(),
            branch_name: branch_name.into(),
            created_at,
            origin: None,
            supersedes: None,
            payload,
        }
    }

    /// Kind of this entity.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    /// The id of the logical entity across branches: the origin if this is a
    /// copy, otherwise its own id.
    #[must_use]
    pub fn lineage_id(&self) -> EntityId {
        self.origin.unwrap_or(self.id)
    }

    /// Duplicates this entity onto another branch with a fresh id.
    ///
    /// `created_at` is kept when `stamp` is `None`.
    #[must_use]
    pub fn copy_to(&self, branch_name: &str, stamp: Option<DateTime<Utc>>) -> Self {
        Self {
            id: EntityId::new(),
            branch_name: branch_name.to_string(),
            created_at: stamp.unwrap_or(self.created_at),
            origin: Some(self.lineage_id()),
            supersedes: None,
            payload: self.payload.clone(),
        }
    }

    /// Searchable free text, if the kind carries any.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            EntityPayload::Fact(f) => Some(&f.text),
            EntityPayload::Observation(o) => Some(&o.content),
            EntityPayload::Message(m) => Some(&m.content),
            _ => None,
        }
    }

    /// Category, for the kinds that have one.
    #[must_use]
    pub fn category(&self) -> Option<&str> {
        match &self.payload {
            EntityPayload::Fact(f) => Some(&f.category),
            EntityPayload::Observation(o) => Some(&o.category),
            _ => None,
        }
    }

    /// Stored embedding, if any.
    #[must_use]
    pub fn embedding(&self) -> Option<&[f32]> {
        match &self.payload {
            EntityPayload::Fact(f) => f.embedding.as_deref(),
            EntityPayload::Observation(o) => o.embedding.as_deref(),
            _ => None,
        }
    }

    /// Returns the fact payload, if this is a fact.
    #[must_use]
    pub const fn as_fact(&self) -> Option<&Fact> {
        match &self.payload {
            EntityPayload::Fact(f) => Some(f),
            _ => None,
        }
    }

    /// Returns the relation payload, if this is a relation.
    #[must_use]
    pub const fn as_relation(&self) -> Option<&Relation> {
        match &self.payload {
            EntityPayload::Relation(r) => Some(r),
            _ => None,
        }
    }

    /// Returns the message payload, if this is a message.
    #[must_use]
    pub const fn as_message(&self) -> Option<&Message> {
        match &self.payload {
            EntityPayload::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the conversation payload, if this is a conversation.
    #[must_use]
    pub const fn as_conversation(&self) -> Option<&Conversation> {
        match &self.payload {
            EntityPayload::Conversation(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fact_rejects_bad_confidence() {
        assert!(Fact::new("sky is blue", "world", 1.2).is_err());
        assert!(Fact::new("sky is blue", "world", f32::NAN).is_err());
        assert!(Fact::new("  ", "world", 0.5).is_err());
        assert!(Fact::new("sky is blue", "world", 0.5).is_ok());
    }

    #[test]
    fn copy_flattens_origin_chain() {
        let fact = Fact::new("F1", "general", 0.7).unwrap();
        let original = Entity::new("main", EntityPayload::Fact(fact));
        let first = original.copy_to("t1", None);
        let second = first.copy_to("t2", None);

        assert_ne!(first.id, original.id);
        assert_eq!(first.origin, Some(original.id));
        assert_eq!(second.origin, Some(original.id));
        assert_eq!(second.lineage_id(), original.lineage_id());
        assert_eq!(second.created_at, original.created_at);
        assert_eq!(second.branch_name, "t2");
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let rel = Relation::new("A", "B", "uses", 0.9).unwrap();
        let entity = Entity::new("main", EntityPayload::Relation(rel));
        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(json["payload"]["kind"], "relation");

        let back: Entity = serde_json::from_value(json).unwrap();
        assert_eq!(back, entity);
        assert_eq!(Envelope::kind(&back), EntityKind::Relation);
    }

    #[test]
    fn relation_key_display() {
        let rel = Relation::new("A", "B", "uses", 0.9).unwrap();
        assert_eq!(rel.key().to_string(), "A -[uses]-> B");
    }
}
