use async_trait::async_trait;
use parley_ai::{ContentBlock, Message, MessageRole};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
/// Opaque failure reported by a conversation store implementation.
pub struct StoreError(pub String);

/// How a persisted assistant turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcomeMarker {
    #[default]
    Completed,
    StoppedByCaller,
    Failed,
}

/// Public struct `TurnRecord` used across Parley components.
///
/// One persisted conversation turn. Ids are assigned by the store and are
/// unique within a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: u64,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub outcome: TurnOutcomeMarker,
    #[serde(default)]
    pub streaming: bool,
    pub created_at_ms: u64,
}

/// A turn to be appended; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub role: MessageRole,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub outcome: TurnOutcomeMarker,
}

impl NewTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_call_id: None,
            outcome: TurnOutcomeMarker::Completed,
        }
    }

    pub fn assistant(content: impl Into<String>, outcome: TurnOutcomeMarker) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            outcome,
        }
    }
}

/// Trait contract for `ConversationStore` behavior.
///
/// The store is the single durable collaborator of a turn: history is read
/// to seed the upstream request and exactly one assistant turn is appended
/// when the turn terminates. Implementations must serialize concurrent
/// appends to the same conversation.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Returns every turn of the conversation in append order. Unknown
    /// conversation ids yield an empty history.
    async fn read_history(&self, conversation_id: &str) -> Result<Vec<TurnRecord>, StoreError>;

    /// Appends one turn and returns it with its generated id.
    async fn append_turn(
        &self,
        conversation_id: &str,
        turn: NewTurn,
    ) -> Result<TurnRecord, StoreError>;

    /// Sets or clears the in-flight streaming marker on a turn.
    async fn mark_streaming(
        &self,
        conversation_id: &str,
        turn_id: u64,
        streaming: bool,
    ) -> Result<(), StoreError>;
}

/// Replays persisted history as upstream request messages. Tool turns
/// without a call id cannot be replayed in valid wire shape and are
/// skipped.
pub fn history_messages(records: &[TurnRecord]) -> Vec<Message> {
    let mut messages = Vec::with_capacity(records.len());
    for record in records {
        match record.role {
            MessageRole::System => messages.push(Message::system(record.content.clone())),
            MessageRole::User => messages.push(Message::user(record.content.clone())),
            MessageRole::Assistant => {
                messages.push(Message::assistant_text(record.content.clone()))
            }
            MessageRole::Tool => {
                let Some(tool_call_id) = &record.tool_call_id else {
                    continue;
                };
                messages.push(Message {
                    role: MessageRole::Tool,
                    content: vec![ContentBlock::Text {
                        text: record.content.clone(),
                    }],
                    tool_call_id: Some(tool_call_id.clone()),
                    tool_name: None,
                    is_error: record.outcome != TurnOutcomeMarker::Completed,
                });
            }
        }
    }
    messages
}
