//! The language-model seam of the session loop
//!
//! The model is opaque: it sees the history and the tool catalog and answers
//! with text, tool-call directives, or both. [`CommandModel`] is a deterministic
//! stand-in that turns `/tool_name {json}` lines into directives.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::mcp::types::ToolDescriptor;
use crate::session::conversation::{ConversationTurn, Role, TurnContent};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallDirective {
    pub name: String,
    pub arguments: Value,
}

impl ToolCallDirective {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCallDirective>,
}

impl ModelOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(tool_calls: Vec<ToolCallDirective>) -> Self {
        Self {
            text: String::new(),
            tool_calls,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("model could not handle the request: {0}")]
    InvalidRequest(String),
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        history: &[ConversationTurn],
        tools: &[ToolDescriptor],
    ) -> Result<ModelOutput, ModelError>;
}

/// Treats `/name {json}` user lines as tool calls and echoes tool results back.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandModel;

impl CommandModel {
    fn parse_command(line: &str) -> Result<ToolCallDirective, ModelError> {
        let command = line.trim_start_matches('/');
        let (name, raw_arguments) = match command.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (command, ""),
        };

        if name.is_empty() {
            return Err(ModelError::InvalidRequest("missing tool name after `/`".to_string()));
        }

        let arguments = if raw_arguments.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str::<Value>(raw_arguments)
                .ok()
                .filter(Value::is_object)
                .ok_or_else(|| {
                    ModelError::InvalidRequest("tool arguments must be a JSON object".to_string())
                })?
        };

        Ok(ToolCallDirective::new(name, arguments))
    }

    fn render_results(history: &[ConversationTurn]) -> String {
        let results: Vec<String> = history
            .iter()
            .rev()
            .take_while(|turn| turn.role != Role::User)
            .filter_map(|turn| match &turn.content {
                TurnContent::ToolResult(result) => {
                    let name = history
                        .iter()
                        .find_map(|earlier| match &earlier.content {
                            TurnContent::ToolCall(request) if request.id == result.id => {
                                Some(request.name.as_str())
                            }
                            _ => None,
                        })
                        .unwrap_or("tool");
                    let verdict = if result.is_error { "failed" } else { "returned" };
                    Some(format!("{name} {verdict}: {}", result.text()))
                }
                _ => None,
            })
            .collect();

        results.into_iter().rev().collect::<Vec<_>>().join("\n")
    }
}

#[async_trait]
impl LanguageModel for CommandModel {
    async fn complete(
        &self,
        history: &[ConversationTurn],
        tools: &[ToolDescriptor],
    ) -> Result<ModelOutput, ModelError> {
        let Some(last) = history.last() else {
            return Err(ModelError::InvalidRequest("empty conversation".to_string()));
        };

        match (&last.role, &last.content) {
            (Role::Tool, _) => Ok(ModelOutput::text(Self::render_results(history))),
            (Role::User, TurnContent::Text { text }) if text.trim_start().starts_with('/') => {
                Ok(ModelOutput::tool_calls(vec![Self::parse_command(text.trim())?]))
            }
            _ => {
                let names: Vec<&str> = tools.iter().map(|tool| tool.name.as_str()).collect();
                Ok(ModelOutput::text(format!(
                    "available tools: {}. Call one with /tool_name {{json arguments}}",
                    if names.is_empty() {
                        "none".to_string()
                    } else {
                        names.join(", ")
                    }
                )))
            }
        }
    }
}
