use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::task::UserId;

/// Hard ceiling on messages per conversation. Once reached the conversation
/// becomes read-only history and the orchestrator rolls over to a fresh one.
pub const MESSAGE_CEILING: usize = 100;

const TITLE_MAX_CHARS: usize = 60;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message role `{other}`")),
        }
    }
}

/// One executed tool call attached to an assistant message. `result` holds
/// either the success payload or a structured failure kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub result: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::User, content, Vec::new())
    }

    pub fn assistant(
        conversation_id: ConversationId,
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Self {
        Self::new(conversation_id, Role::Assistant, content, tool_calls)
    }

    fn new(
        conversation_id: ConversationId,
        role: Role,
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id,
            role,
            content: content.into(),
            tool_calls,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: UserId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(user_id: UserId, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::generate(),
            user_id,
            title: title.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Derive a conversation title from the first user message: single line,
/// trimmed, cut at a word boundary within the character budget.
pub fn derive_title(first_message: &str) -> String {
    let line = first_message.lines().next().unwrap_or("").trim();
    if line.is_empty() {
        return "New conversation".to_string();
    }

    let chars = line.chars().count();
    if chars <= TITLE_MAX_CHARS {
        return line.to_string();
    }

    let cut: String = line.chars().take(TITLE_MAX_CHARS).collect();
    let trimmed = match cut.rfind(' ') {
        Some(space) if space > TITLE_MAX_CHARS / 2 => &cut[..space],
        _ => cut.as_str(),
    };
    format!("{}…", trimmed.trim_end())
}

#[cfg(test)]
mod tests {
    use super::{derive_title, ConversationId, Message, Role};

    #[test]
    fn short_first_message_becomes_title_verbatim() {
        assert_eq!(derive_title("Add buy milk"), "Add buy milk");
    }

    #[test]
    fn long_title_is_cut_at_a_word_boundary() {
        let text = "Please add a reminder to pick up the dry cleaning before the shop closes on Friday";
        let title = derive_title(text);
        assert!(title.chars().count() <= 61);
        assert!(title.ends_with('…'));
        assert!(!title.trim_end_matches('…').ends_with(' '));
    }

    #[test]
    fn empty_message_falls_back_to_default_title() {
        assert_eq!(derive_title("   \n"), "New conversation");
    }

    #[test]
    fn assistant_constructor_carries_tool_calls() {
        let conversation = ConversationId::generate();
        let message = Message::assistant(conversation.clone(), "done", Vec::new());
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.conversation_id, conversation);
        assert!(message.tool_calls.is_empty());
    }
}
