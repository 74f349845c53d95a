use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::{ToolCall, ToolOutcome};

/// A single turn in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: Vec<MessageContent>,
    pub timestamp: DateTime<Utc>,
    /// Tool calls requested by the assistant in this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block within a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
}

impl Message {
    /// Create a simple text message.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: vec![MessageContent::Text { text: text.into() }],
            timestamp: Utc::now(),
            tool_calls: vec![],
        }
    }

    /// A tool-role message carrying one outcome, correlated by call id.
    pub fn tool_outcome(outcome: &ToolOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Tool,
            content: vec![MessageContent::ToolResult {
                tool_call_id: outcome.tool_call_id.clone(),
                content: outcome.output.clone(),
                is_error: outcome.is_error,
            }],
            timestamp: Utc::now(),
            tool_calls: vec![],
        }
    }

    /// Extract all text content joined together.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                MessageContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Ordered turns of a single execution. Lives only as long as one executor
/// invocation and is never persisted.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    /// Seed a conversation with the instruction as the only turn.
    pub fn seeded(instruction: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::text(Role::User, instruction)],
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// All tool outcomes recorded so far, in append order.
    pub fn tool_outcomes(&self) -> impl Iterator<Item = (&str, &str, bool)> {
        self.messages.iter().flat_map(|m| {
            m.content.iter().filter_map(|c| match c {
                MessageContent::ToolResult {
                    tool_call_id,
                    content,
                    is_error,
                } => Some((tool_call_id.as_str(), content.as_str(), *is_error)),
                _ => None,
            })
        })
    }
}
