//! Entity write path: facts, observations, sessions, conversations, messages.
//!
//! Embedding happens before anything is staged, so a slow or failing provider
//! never holds a transaction open.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::entity::{
    Conversation, Entity, EntityId, EntityKind, EntityPayload, Fact, Message, MessageRole, Observation, Session,
};
use crate::error::{KyroMemResult, MemError, ValidationError};
use crate::storage::Transaction;

use super::KyroMem;

/// What a write does when its text cannot be embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingPolicy {
    /// Fail the write.
    #[default]
    Require,
    /// Store the entity without an embedding and log a warning.
    BestEffort,
    /// Never embed on write.
    Skip,
}

impl KyroMem {
    fn embed_for_write(&self, text: &str) -> KyroMemResult<Option<Vec<f32>>> {
        let Some(embedder) = &self.embedder else {
            return Ok(None);
        };
        if self.config.embedding_policy == EmbeddingPolicy::Skip {
            return Ok(None);
        }
        match embedder.embed(text) {
            Ok(vector) => Ok(Some(vector)),
            Err(err) if self.config.embedding_policy == EmbeddingPolicy::BestEffort => {
                tracing::warn!(provider = embedder.name(), error = %err, "embedding failed; storing without embedding");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn insert(&self, ctx: &RequestContext, label: &'static str, entity: Entity) -> KyroMemResult<Entity> {
        let mut tx = Transaction::begin(self.store.as_ref(), label).with_cancellation(ctx.cancel.clone());
        tx.insert_entity(entity.clone())?;
        tx.commit()?;
        tracing::debug!(branch = %entity.branch_name, kind = %entity.kind(), id = %entity.id, "wrote entity");
        Ok(entity)
    }

    /// Records a fact on `ctx.branch`, embedding its text per the
    /// configured [`EmbeddingPolicy`].
    ///
    /// # Errors
    ///
    /// - `Validation` for empty text or out-of-range confidence
    /// - `BranchNotFound` / `BranchInactive` for the branch
    /// - `Embedding` under [`EmbeddingPolicy::Require`]
    pub fn write_fact(&self, ctx: &RequestContext, text: &str, category: &str, confidence: f32) -> KyroMemResult<Entity> {
        self.ready()?;
        let mut fact = Fact::new(text, category, confidence)?;
        self.branches.usable_branch(&ctx.branch)?;
        fact.embedding = self.embed_for_write(&fact.text)?;
        self.insert(ctx, "write_fact", Entity::new(ctx.branch.clone(), EntityPayload::Fact(fact)))
    }

    /// Records an observation on `ctx.branch`.
    ///
    /// # Errors
    ///
    /// Same as [`KyroMem::write_fact`].
    pub fn write_observation(
        &self,
        ctx: &RequestContext,
        content: &str,
        category: &str,
        source: Option<&str>,
    ) -> KyroMemResult<Entity> {
        self.ready()?;
        let mut observation = Observation::new(content, category)?;
        observation.source = source.map(str::to_string);
        self.branches.usable_branch(&ctx.branch)?;
        observation.embedding = self.embed_for_write(&observation.content)?;
        self.insert(
            ctx,
            "write_observation",
            Entity::new(ctx.branch.clone(), EntityPayload::Observation(observation)),
        )
    }

    /// Records a session header on `ctx.branch`.
    ///
    /// The session id is `ctx.session_id`, or a fresh UUID when unset.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` / `BranchInactive` for the branch.
    pub fn start_session(
        &self,
        ctx: &RequestContext,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> KyroMemResult<Entity> {
        self.ready()?;
        self.branches.usable_branch(&ctx.branch)?;
        let session = Session {
            session_id: ctx
                .session_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            agent_id: ctx.agent_id.clone(),
            metadata,
        };
        self.insert(ctx, "start_session", Entity::new(ctx.branch.clone(), EntityPayload::Session(session)))
    }

    /// Records a conversation header on `ctx.branch` for `ctx.session_id`.
    ///
    /// # Errors
    ///
    /// - `Validation` if the context carries no session id
    /// - `BranchNotFound` / `BranchInactive` for the branch
    pub fn start_conversation(
        &self,
        ctx: &RequestContext,
        task_id: Option<&str>,
        title: Option<&str>,
    ) -> KyroMemResult<Entity> {
        self.ready()?;
        let session_id = ctx.session_id.clone().ok_or_else(|| ValidationError::MissingField {
            field: "session_id".to_string(),
        })?;
        self.branches.usable_branch(&ctx.branch)?;
        let conversation = Conversation {
            session_id,
            agent_id: ctx.agent_id.clone(),
            task_id: task_id.map(str::to_string),
            title: title.map(str::to_string),
        };
        self.insert(
            ctx,
            "start_conversation",
            Entity::new(ctx.branch.clone(), EntityPayload::Conversation(conversation)),
        )
    }

    /// Appends the next message of a conversation on `ctx.branch`.
    ///
    /// The message gets the next sequence number. Two concurrent appends to
    /// the same branch cannot both commit; the loser gets `WriteConflict`.
    ///
    /// # Errors
    ///
    /// - `Validation` for empty content, or if the conversation lives on
    ///   another branch
    /// - `EntityNotFound` if `conversation_id` is not a conversation
    /// - `BranchNotFound` / `BranchInactive` for the branch
    /// - `Storage(WriteConflict)` on a concurrent append
    pub fn append_message(
        &self,
        ctx: &RequestContext,
        conversation_id: EntityId,
        role: MessageRole,
        content: &str,
        tool_calls: Option<serde_json::Value>,
    ) -> KyroMemResult<Entity> {
        self.ready()?;
        if content.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "content".to_string(),
            }
            .into());
        }
        let conversation = self
            .store
            .get_entity(conversation_id)?
            .filter(|e| e.kind() == EntityKind::Conversation)
            .ok_or_else(|| MemError::not_found(EntityKind::Conversation, conversation_id))?;
        if conversation.branch_name != ctx.branch {
            return Err(ValidationError::InvalidOperation {
                reason: format!(
                    "conversation {conversation_id} is on branch '{}', not '{}'",
                    conversation.branch_name, ctx.branch
                ),
            }
            .into());
        }
        self.branches.usable_branch(&ctx.branch)?;

        let mut tx = Transaction::begin(self.store.as_ref(), "append_message").with_cancellation(ctx.cancel.clone());
        tx.guard_branch(&ctx.branch)?;
        let sequence = self
            .store
            .conversation_messages(conversation_id)?
            .iter()
            .filter_map(|e| e.as_message().map(|m| m.sequence + 1))
            .max()
            .unwrap_or(0);

        let message = Message {
            conversation_id,
            sequence,
            role,
            content: content.to_string(),
            tool_calls,
        };
        let entity = Entity::new(ctx.branch.clone(), EntityPayload::Message(message));
        tx.insert_entity(entity.clone())?;
        tx.commit()?;
        tracing::debug!(branch = %ctx.branch, conversation = %conversation_id, sequence, "appended message");
        Ok(entity)
    }
}
