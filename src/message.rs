use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who authored a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageAuthor {
    User,
    Bot,
    System,
}

/// The message kind decides whether the broker/executor treats it as
/// consumable input for the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Event,
    ToolResult,
    Cards,
    CollectDetailsForm,
}

/// One entry in a conversation's append-only log. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Message {
    id: String,
    author: MessageAuthor,
    kind: MessageKind,
    body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    created_at: DateTime<Utc>,
}

/// What callers hand to [`ConversationLog::append`]; the log assigns id and
/// timestamp so ordering is creation-order by construction.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NewMessage {
    pub author: MessageAuthor,
    pub kind: MessageKind,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl NewMessage {
    pub fn user_text(body: impl Into<String>) -> Self {
        Self {
            author: MessageAuthor::User,
            kind: MessageKind::Text,
            body: body.into(),
            data: None,
        }
    }

    pub fn bot_text(body: impl Into<String>) -> Self {
        Self {
            author: MessageAuthor::Bot,
            kind: MessageKind::Text,
            body: body.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl Message {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn author(&self) -> MessageAuthor {
        self.author
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True when this message can resolve a pending flow step or start a new
    /// turn: user-authored text, events (button clicks) and form submissions.
    pub fn is_consumable_input(&self) -> bool {
        self.author == MessageAuthor::User
            && matches!(
                self.kind,
                MessageKind::Text | MessageKind::Event | MessageKind::CollectDetailsForm
            )
    }
}

/// Narrow interface onto the surrounding system's message persistence. The
/// core only ever reads the most recent N messages and appends new ones.
#[async_trait]
pub trait ConversationLog: Send + Sync + Debug {
    /// Appends and returns the stored message with its assigned id/timestamp.
    async fn append(&self, conversation_id: &str, message: NewMessage) -> Message;

    /// The most recent `limit` messages, oldest first.
    async fn recent(&self, conversation_id: &str, limit: usize) -> Vec<Message>;
}

/// In-memory log for tests and embedded hosts.
#[derive(Debug, Default)]
pub struct InMemoryConversationLog {
    conversations: DashMap<String, Vec<Message>>,
}

impl InMemoryConversationLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Full history snapshot, oldest first. Test helper.
    pub fn all(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations
            .get(conversation_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConversationLog for InMemoryConversationLog {
    async fn append(&self, conversation_id: &str, message: NewMessage) -> Message {
        let stored = Message {
            id: uuid::Uuid::new_v4().to_string(),
            author: message.author,
            kind: message.kind,
            body: message.body,
            data: message.data,
            created_at: Utc::now(),
        };
        self.conversations
            .entry(conversation_id.to_string())
            .or_default()
            .push(stored.clone());
        stored
    }

    async fn recent(&self, conversation_id: &str, limit: usize) -> Vec<Message> {
        match self.conversations.get(conversation_id) {
            Some(messages) => {
                let skip = messages.len().saturating_sub(limit);
                messages.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }
}

/// Renders history for inclusion in a model prompt, one line per turn.
pub fn history_as_prompt(history: &[Message]) -> String {
    let mut out = String::new();
    for msg in history {
        let role = match msg.author() {
            MessageAuthor::User => "user",
            MessageAuthor::Bot => "assistant",
            MessageAuthor::System => "system",
        };
        out.push_str(role);
        out.push_str(": ");
        out.push_str(msg.body());
        out.push('\n');
    }
    out
}

/// Counts appended messages by kind. Test helper.
pub fn count_by_kind(messages: &[Message]) -> HashMap<MessageKind, usize> {
    let mut counts = HashMap::new();
    for msg in messages {
        *counts.entry(msg.kind()).or_insert(0) += 1;
    }
    counts
}
