//! Server-side dispatch loop
//!
//! Reads frames from one connection, answers `list_tools` inline and runs each
//! `tool_call` on its own task. A semaphore shared by every session bounds how
//! many invocations run at once. Every invocation is audited with sensitive
//! argument keys redacted.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::domain::registry::ToolRegistry;
use crate::errors::TransportError;
use crate::mcp::codec;
use crate::mcp::types::{Message, ToolCallRequest, ToolCallResult};
use crate::transport::Connection;

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, max_concurrent_calls: usize) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Serves one connection until the peer goes away.
    ///
    /// A clean close ends with `Ok(())`; a broken connection is returned as the error.
    /// Invocations still running when the connection ends finish, but their results
    /// are discarded.
    pub async fn serve(self, connection: Arc<dyn Connection>) -> Result<(), TransportError> {
        loop {
            let frame = match connection.receive().await {
                Ok(frame) => frame,
                Err(TransportError::Closed) => {
                    debug!("connection closed, dispatcher stopping");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            let message = match codec::decode(&frame) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "dropping malformed frame");
                    continue;
                }
            };

            match message {
                Message::ListTools { id } => {
                    let reply = Message::ToolList {
                        id,
                        tools: self.registry.list(),
                    };
                    match connection.send(codec::encode(&reply)).await {
                        Ok(()) => {}
                        Err(TransportError::Closed) => return Ok(()),
                        Err(err) => return Err(err),
                    }
                }
                Message::ToolCall(request) => {
                    let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                        return Ok(());
                    };
                    let dispatcher = self.clone();
                    let connection = Arc::clone(&connection);
                    tokio::spawn(async move {
                        let result = dispatcher.invoke(request).await;
                        drop(permit);

                        let id = result.id.clone();
                        let reply = codec::encode(&Message::ToolResult(result));
                        if let Err(err) = connection.send(reply).await {
                            debug!(id = %id, error = %err, "discarding result for a closed session");
                        }
                    });
                }
                Message::Text { content } => {
                    info!(content = %content, "client notice");
                }
                other => {
                    warn!(kind = other.kind(), "ignoring unexpected message from client");
                }
            }
        }
    }

    pub async fn invoke(&self, request: ToolCallRequest) -> ToolCallResult {
        let audit_arguments = redact_audit_value(&request.arguments);

        let result = match self
            .registry
            .invoke(&request.name, request.arguments)
            .await
        {
            Ok(output) => ToolCallResult {
                id: request.id,
                content: output.content,
                is_error: output.is_error,
            },
            Err(err) => ToolCallResult::error(request.id, err.to_string()),
        };

        info!(
            tool = %request.name,
            arguments = %audit_arguments,
            outcome = if result.is_error { "failure" } else { "success" },
            "tool call audited"
        );

        result
    }
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "api_key" | "apikey"
    ) || ["token", "secret", "password", "credential"]
        .iter()
        .any(|marker| normalized.contains(marker))
}
