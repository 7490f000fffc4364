//! Append-only conversation history owned by one session

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mcp::types::{ToolCallRequest, ToolCallResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnContent {
    Text { text: String },
    ToolCall(ToolCallRequest),
    ToolResult(ToolCallResult),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: TurnContent,
    pub at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(Role::User, TurnContent::Text { text: text.into() });
    }

    pub fn push_model_text(&mut self, text: impl Into<String>) {
        self.push(Role::Model, TurnContent::Text { text: text.into() });
    }

    pub fn push_tool_call(&mut self, request: ToolCallRequest) {
        self.push(Role::Model, TurnContent::ToolCall(request));
    }

    pub fn push_tool_result(&mut self, result: ToolCallResult) {
        self.push(Role::Tool, TurnContent::ToolResult(result));
    }

    fn push(&mut self, role: Role, content: TurnContent) {
        self.turns.push(ConversationTurn {
            role,
            content,
            at: Utc::now(),
        });
    }
}
