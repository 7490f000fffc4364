//! Protocol data model shared by the client session and the server dispatcher

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation token tying a tool result (or tool listing) to its request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tool as seen by clients: everything but the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: CallId,
    pub name: String,
    #[serde(default = "empty_arguments")]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: CallId, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id,
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub id: CallId,
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn success(id: CallId, content: Value) -> Self {
        Self {
            id,
            content,
            is_error: false,
        }
    }

    pub fn error(id: CallId, message: impl Into<String>) -> Self {
        Self {
            id,
            content: Value::String(message.into()),
            is_error: true,
        }
    }

    /// Textual view of the content: strings as-is, anything else as JSON.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// Every frame exchanged between client and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    ListTools { id: CallId },
    ToolList { id: CallId, tools: Vec<ToolDescriptor> },
    ToolCall(ToolCallRequest),
    ToolResult(ToolCallResult),
    Text { content: String },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ListTools { .. } => "list_tools",
            Self::ToolList { .. } => "tool_list",
            Self::ToolCall(_) => "tool_call",
            Self::ToolResult(_) => "tool_result",
            Self::Text { .. } => "text",
        }
    }

    /// Id of a message that expects a reply.
    pub fn request_id(&self) -> Option<&CallId> {
        match self {
            Self::ListTools { id } => Some(id),
            Self::ToolCall(request) => Some(&request.id),
            _ => None,
        }
    }

    /// Id of a message that answers an earlier request.
    pub fn reply_id(&self) -> Option<&CallId> {
        match self {
            Self::ToolList { id, .. } => Some(id),
            Self::ToolResult(result) => Some(&result.id),
            _ => None,
        }
    }
}

fn empty_arguments() -> Value {
    Value::Object(Map::new())
}
