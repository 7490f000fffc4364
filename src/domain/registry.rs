//! Server-side tool catalog
//!
//! Tools are registered once at startup and listed in registration order.
//! Each input schema is compiled when the tool is registered; invocation
//! validates arguments against it and runs the
//! handler on its own task so a panicking handler is reported like any other
//! handler failure.

use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use jsonschema::Validator;
use serde_json::Value;
use tracing::warn;

use crate::errors::{HandlerFailure, RegistryError};
use crate::mcp::types::ToolDescriptor;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, arguments: Value) -> Result<Value, HandlerFailure>;
}

/// Adapts an async closure into a [`ToolHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(handler: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerFailure>> + Send + 'static,
{
    FnHandler(handler)
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerFailure>> + Send + 'static,
{
    async fn handle(&self, arguments: Value) -> Result<Value, HandlerFailure> {
        (self.0)(arguments).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: Value,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            content: Value::String(message.into()),
            is_error: true,
        }
    }
}

/// At most this many schema violations are reported per rejected call.
const MAX_REPORTED_VIOLATIONS: usize = 5;

struct RegisteredTool {
    descriptor: ToolDescriptor,
    validator: Validator,
    handler: Arc<dyn ToolHandler>,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        descriptor: ToolDescriptor,
        handler: impl ToolHandler + 'static,
    ) -> Result<(), RegistryError> {
        if self.by_name.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateToolName(descriptor.name));
        }

        let validator = jsonschema::validator_for(&descriptor.input_schema).map_err(|err| {
            RegistryError::InvalidSchema {
                tool: descriptor.name.clone(),
                reason: err.to_string(),
            }
        })?;

        self.by_name
            .insert(descriptor.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool {
            descriptor,
            validator,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|tool| tool.descriptor.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.by_name
            .get(name)
            .map(|index| &self.tools[*index].descriptor)
    }

    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutput, RegistryError> {
        let tool = self
            .by_name
            .get(name)
            .map(|index| &self.tools[*index])
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))?;

        if !tool.validator.is_valid(&arguments) {
            let reason = tool
                .validator
                .iter_errors(&arguments)
                .take(MAX_REPORTED_VIOLATIONS)
                .map(|err| err.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(RegistryError::SchemaMismatch {
                tool: name.to_string(),
                reason,
            });
        }

        let handler = Arc::clone(&tool.handler);
        let outcome = tokio::spawn(async move { handler.handle(arguments).await }).await;

        match outcome {
            Ok(Ok(content)) => Ok(ToolOutput::success(content)),
            Ok(Err(failure)) => {
                warn!(tool = %name, error = %failure, "tool handler failed");
                Ok(ToolOutput::failure(failure.message))
            }
            Err(join_error) => {
                warn!(tool = %name, error = %join_error, "tool handler aborted");
                Ok(ToolOutput::failure(format!("tool `{name}` failed unexpectedly")))
            }
        }
    }
}
