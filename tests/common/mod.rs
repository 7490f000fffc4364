//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use url::Url;

use toolcall_mcp::domain::registry::{ToolHandler, ToolRegistry};
use toolcall_mcp::domain::tools::default_registry;
use toolcall_mcp::errors::HandlerFailure;
use toolcall_mcp::mcp::dispatcher::Dispatcher;
use toolcall_mcp::mcp::types::ToolDescriptor;
use toolcall_mcp::session::conversation::ConversationTurn;
use toolcall_mcp::session::model::{LanguageModel, ModelError, ModelOutput};
use toolcall_mcp::session::SessionConfig;
use toolcall_mcp::transport::{Connection, PipeConnection};
use toolcall_mcp::{serve_event_stream, AppState};

/// Replays canned outputs and records every history it was shown.
pub struct ScriptedModel {
    script: Mutex<VecDeque<ModelOutput>>,
    histories: Mutex<Vec<Vec<ConversationTurn>>>,
}

impl ScriptedModel {
    pub fn new(outputs: Vec<ModelOutput>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outputs.into()),
            histories: Mutex::new(Vec::new()),
        })
    }

    pub fn histories(&self) -> Vec<Vec<ConversationTurn>> {
        self.histories.lock().expect("histories lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.histories.lock().expect("histories lock").len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(
        &self,
        history: &[ConversationTurn],
        _tools: &[ToolDescriptor],
    ) -> Result<ModelOutput, ModelError> {
        self.histories
            .lock()
            .expect("histories lock")
            .push(history.to_vec());
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .ok_or_else(|| ModelError::Unavailable("script exhausted".to_string()))
    }
}

/// Echoes its arguments after an optional `delay_ms`, announcing each start.
pub struct SlowEcho {
    pub started: Arc<Notify>,
}

#[async_trait]
impl ToolHandler for SlowEcho {
    async fn handle(&self, arguments: Value) -> Result<Value, HandlerFailure> {
        self.started.notify_one();
        if let Some(delay) = arguments.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(arguments)
    }
}

/// Built-in tools plus `slow_echo`.
pub fn test_registry(started: Arc<Notify>) -> ToolRegistry {
    let mut registry = default_registry().expect("built-in tools");
    registry
        .register(
            ToolDescriptor::new(
                "slow_echo",
                json!({
                    "type": "object",
                    "properties": {"delay_ms": {"type": "integer"}}
                }),
            )
            .with_description("Echoes its arguments, optionally after a delay"),
            SlowEcho { started },
        )
        .expect("register slow_echo");
    registry
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        reply_timeout: Duration::from_secs(5),
        max_tool_rounds: 4,
    }
}

/// A dispatcher serving `registry` on one end of an in-memory pipe.
pub fn pipe_server(registry: ToolRegistry) -> Box<dyn Connection> {
    let (client, server) = PipeConnection::pair();
    let dispatcher = Dispatcher::new(Arc::new(registry), 4);
    tokio::spawn(dispatcher.serve(Arc::new(server)));
    Box::new(client)
}

/// The event-stream surface running in the background on an ephemeral port.
pub struct TestServer {
    pub base_url: Url,
    pub state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(registry: ToolRegistry) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let state = AppState::new(Arc::new(registry), 4);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn({
            let state = state.clone();
            async move {
                serve_event_stream(listener, state, async move {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("server");
            }
        });

        Self {
            base_url: Url::parse(&format!("http://{addr}")).expect("base url"),
            state,
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    /// Waits until `count` sessions are open on the server.
    pub async fn wait_for_sessions(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.state.sessions.len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sessions did not reach the expected count");
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.handle).await;
    }
}
