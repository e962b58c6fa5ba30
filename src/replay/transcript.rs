//! Read-only conversation replay.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::branch::BranchManager;
use crate::entity::{Entity, EntityId, EntityKind, MessageRole};
use crate::error::{KyroMemResult, MemError, ValidationError};
use crate::storage::Store;

/// Defaults applied to replays that do not override them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayDefaults {
    /// Grounding matches attached to each user turn.
    pub top_k: usize,
    /// Message cap when a replay does not set one.
    pub max_messages: Option<usize>,
    /// Upper bound on a judge call, in milliseconds.
    pub judge_timeout_ms: Option<u64>,
}

impl Default for ReplayDefaults {
    fn default() -> Self {
        Self {
            top_k: 3,
            max_messages: None,
            judge_timeout_ms: Some(30_000),
        }
    }
}

impl ReplayDefaults {
    /// Validates the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for a zero `top_k`, message cap
    /// or timeout.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.top_k == 0 || self.max_messages == Some(0) || self.judge_timeout_ms == Some(0) {
            return Err(ValidationError::InvalidConfig {
                reason: "replay top_k, max_messages and judge_timeout_ms must be > 0".to_string(),
            });
        }
        Ok(self)
    }
}

/// Options for one replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Branch whose facts and observations ground each user turn.
    pub reground_branch: Option<String>,
    /// Grounding matches per user turn; the engine default when unset.
    pub top_k: Option<usize>,
    /// Keep only these roles.
    pub roles: Option<Vec<MessageRole>>,
    /// Keep at most this many messages, from the start.
    pub max_messages: Option<usize>,
}

impl ReplayConfig {
    /// Grounds user turns against `branch`.
    #[must_use]
    pub fn reground_on(mut self, branch: impl Into<String>) -> Self {
        self.reground_branch = Some(branch.into());
        self
    }

    /// Keeps only `roles`.
    #[must_use]
    pub fn only_roles(mut self, roles: &[MessageRole]) -> Self {
        self.roles = Some(roles.to_vec());
        self
    }

    /// Caps the number of replayed messages.
    #[must_use]
    pub const fn limit(mut self, max_messages: usize) -> Self {
        self.max_messages = Some(max_messages);
        self
    }
}

/// A fact or observation matched to a user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingMatch {
    /// Matched entity.
    pub entity_id: EntityId,
    /// Its kind.
    pub kind: EntityKind,
    /// Its text.
    pub text: String,
    /// BM25 score against the turn.
    pub score: f32,
}

/// One replayed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    /// Source message.
    pub message_id: EntityId,
    /// Position in the conversation.
    pub sequence: u32,
    /// Author.
    pub role: MessageRole,
    /// Body.
    pub content: String,
    /// Tool calls, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
    /// When the message was recorded.
    pub created_at: DateTime<Utc>,
    /// Grounding matches; empty unless regrounding was requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grounding: Vec<GroundingMatch>,
}

/// Ordered view of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    /// Replayed conversation.
    pub conversation_id: EntityId,
    /// Branch the conversation lives on.
    pub branch: String,
    /// Conversation title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Branch used for grounding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounded_on: Option<String>,
    /// Turns in sequence order.
    pub turns: Vec<TranscriptTurn>,
}

impl Transcript {
    /// True if no turn survived filtering.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Plain-text rendering, one `[role] content` line per turn with
    /// grounding lines indented below user turns.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for turn in &self.turns {
            let _ = writeln!(out, "[{}] {}", turn.role, turn.content);
            for m in &turn.grounding {
                let _ = writeln!(out, "    ({}) {}", m.kind, m.text);
            }
        }
        out
    }
}

/// Replays stored conversations. Never writes.
pub struct ReplayEngine {
    store: Arc<dyn Store>,
    branches: BranchManager,
    defaults: ReplayDefaults,
}

impl std::fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl ReplayEngine {
    /// Creates a replay engine.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, defaults: ReplayDefaults) -> Self {
        Self {
            branches: BranchManager::new(Arc::clone(&store)),
            store,
            defaults,
        }
    }

    /// Builds the transcript of `conversation_id`.
    ///
    /// Role filtering happens before the message cap.
    ///
    /// # Errors
    ///
    /// - `EntityNotFound` if the id is not a conversation
    /// - `BranchNotFound` for an unknown regrounding branch
    /// - `Validation` for a zero `top_k` or `max_messages`
    pub fn replay(&self, conversation_id: EntityId, config: &ReplayConfig) -> KyroMemResult<Transcript> {
        let conversation = self
            .store
            .get_entity(conversation_id)?
            .filter(|e| e.kind() == EntityKind::Conversation)
            .ok_or_else(|| MemError::not_found(EntityKind::Conversation, conversation_id))?;

        let top_k = config.top_k.unwrap_or(self.defaults.top_k);
        let max_messages = config.max_messages.or(self.defaults.max_messages);
        if top_k == 0 || max_messages == Some(0) {
            return Err(ValidationError::InvalidOperation {
                reason: "top_k and max_messages must be > 0".to_string(),
            }
            .into());
        }
        if let Some(branch) = &config.reground_branch {
            self.branches.get_branch(branch)?;
        }

        let mut turns = Vec::new();
        for entity in self.store.conversation_messages(conversation_id)? {
            let Some(message) = entity.as_message() else {
                continue;
            };
            if config.roles.as_ref().is_some_and(|roles| !roles.contains(&message.role)) {
                continue;
            }
            if max_messages.is_some_and(|max| turns.len() >= max) {
                break;
            }

            let grounding = match (&config.reground_branch, message.role) {
                (Some(branch), MessageRole::User) => self.ground(branch, &message.content, top_k)?,
                _ => Vec::new(),
            };
            turns.push(TranscriptTurn {
                message_id: entity.id,
                sequence: message.sequence,
                role: message.role,
                content: message.content.clone(),
                tool_calls: message.tool_calls.clone(),
                created_at: entity.created_at,
                grounding,
            });
        }

        tracing::debug!(
            conversation = %conversation_id,
            turns = turns.len(),
            grounded_on = config.reground_branch.as_deref(),
            "replayed conversation"
        );
        Ok(Transcript {
            conversation_id,
            branch: conversation.branch_name.clone(),
            title: conversation.as_conversation().and_then(|c| c.title.clone()),
            grounded_on: config.reground_branch.clone(),
            turns,
        })
    }

    /// Top lexical fact/observation matches for `text` on `branch`.
    fn ground(&self, branch: &str, text: &str, top_k: usize) -> KyroMemResult<Vec<GroundingMatch>> {
        let mut matches = Vec::with_capacity(top_k);
        for (id, score) in self.store.text_search(branch, text)? {
            if matches.len() >= top_k {
                break;
            }
            let Some(entity) = self.store.get_entity(id)? else {
                continue;
            };
            if let Some(m) = grounding_match(&entity, score) {
                matches.push(m);
            }
        }
        Ok(matches)
    }
}

fn grounding_match(entity: &Entity, score: f32) -> Option<GroundingMatch> {
    let kind = entity.kind();
    if !matches!(kind, EntityKind::Fact | EntityKind::Observation) {
        return None;
    }
    Some(GroundingMatch {
        entity_id: entity.id,
        kind,
        text: entity.text()?.to_string(),
        score,
    })
}
