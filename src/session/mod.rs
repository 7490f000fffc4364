//! Client-side session loop
//!
//! A session owns one connection and one conversation. Each user input drives the
//! model until it answers without tool calls; every tool call is sent, awaited by
//! correlation id and folded into the history before the next one is sent.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::TransportError;
use crate::mcp::codec;
use crate::mcp::types::{CallId, Message, ToolCallRequest, ToolCallResult, ToolDescriptor};
use crate::transport::Connection;

pub mod conversation;
pub mod model;
pub mod pending;

use conversation::Conversation;
use model::{LanguageModel, ModelError};
use pending::{PendingCalls, Reply};

pub const TRUNCATION_NOTICE: &str = "[response truncated: tool round limit reached]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingUserInput,
    ModelThinking,
    ToolDispatch,
    RespondingToUser,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub reply_timeout: Duration,
    pub max_tool_rounds: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(60),
            max_tool_rounds: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("console i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("session has ended")]
    Terminated,
}

impl SessionError {
    /// Model failures only spoil the current input; everything else ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Model(_))
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(TransportError::LostInFlight(ids)) => format!(
                "the connection to the tool server was interrupted and {} tool call(s) were lost",
                ids.len()
            ),
            Self::Transport(TransportError::Timeout) => {
                "the tool server did not answer in time".to_string()
            }
            Self::Transport(TransportError::Closed) => {
                "the tool server closed the connection".to_string()
            }
            Self::Transport(TransportError::Broken(reason)) => {
                format!("the connection to the tool server failed: {reason}")
            }
            Self::Model(err) => format!("the model could not answer: {err}"),
            Self::Protocol(reason) => format!("the tool server misbehaved: {reason}"),
            Self::Io(err) => format!("console i/o failed: {err}"),
            Self::Terminated => "this session has already ended".to_string(),
        }
    }
}

pub struct Session {
    connection: Box<dyn Connection>,
    model: Arc<dyn LanguageModel>,
    config: SessionConfig,
    catalog: Vec<ToolDescriptor>,
    conversation: Conversation,
    pending: PendingCalls,
    state: SessionState,
}

impl Session {
    /// Opens the session and fetches the tool catalog once.
    pub async fn start(
        connection: Box<dyn Connection>,
        model: Arc<dyn LanguageModel>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let mut session = Self {
            connection,
            model,
            config,
            catalog: Vec::new(),
            conversation: Conversation::new(),
            pending: PendingCalls::new(),
            state: SessionState::AwaitingUserInput,
        };

        match session.fetch_catalog().await {
            Ok(catalog) => {
                info!(tools = catalog.len(), "session started");
                session.catalog = catalog;
                Ok(session)
            }
            Err(err) => {
                session.terminate().await;
                Err(err)
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn catalog(&self) -> &[ToolDescriptor] {
        &self.catalog
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn outstanding_requests(&self) -> usize {
        self.pending.len()
    }

    pub async fn handle_user_input(&mut self, input: &str) -> Result<String, SessionError> {
        if self.state == SessionState::Terminated {
            return Err(SessionError::Terminated);
        }

        match self.run_turn(input).await {
            Ok(answer) => Ok(answer),
            Err(err) if err.is_fatal() => {
                warn!(error = %err, "session terminated");
                self.terminate().await;
                Err(err)
            }
            Err(err) => {
                warn!(error = %err, "input failed, session continues");
                self.state = SessionState::AwaitingUserInput;
                Err(err)
            }
        }
    }

    /// Line-oriented console loop. `exit` or `quit` ends the session; blank lines are skipped.
    pub async fn run<R, W>(&mut self, input: R, mut output: W) -> Result<(), SessionError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if matches!(line, "exit" | "quit") {
                break;
            }

            match self.handle_user_input(line).await {
                Ok(answer) => {
                    output
                        .write_all(format!("assistant: {answer}\n").as_bytes())
                        .await?
                }
                Err(err) if err.is_fatal() => {
                    output
                        .write_all(format!("session ended: {}\n", err.user_message()).as_bytes())
                        .await?;
                    output.flush().await?;
                    return Err(err);
                }
                Err(err) => {
                    output
                        .write_all(format!("error: {}\n", err.user_message()).as_bytes())
                        .await?
                }
            }
            output.flush().await?;
        }

        self.close().await;
        Ok(())
    }

    pub async fn close(&mut self) {
        if self.state != SessionState::Terminated {
            info!("session closed");
            self.terminate().await;
        }
    }

    async fn terminate(&mut self) {
        self.state = SessionState::Terminated;
        let abandoned = self.pending.fail_all();
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "abandoning outstanding requests");
        }
        self.connection.close().await;
    }

    async fn fetch_catalog(&mut self) -> Result<Vec<ToolDescriptor>, SessionError> {
        let id = CallId::generate();
        self.issue(&id)?;
        self.connection
            .send(codec::encode(&Message::ListTools { id: id.clone() }))
            .await?;

        let tools = match self.await_reply(&id).await? {
            Reply::ToolList(tools) => tools,
            Reply::ToolResult(_) => {
                return Err(SessionError::Protocol(format!(
                    "`{id}` was answered with a tool result"
                )))
            }
        };

        let mut seen = HashSet::new();
        Ok(tools
            .into_iter()
            .filter(|tool| {
                let first = seen.insert(tool.name.clone());
                if !first {
                    warn!(tool = %tool.name, "duplicate tool name in catalog, keeping the first");
                }
                first
            })
            .collect())
    }

    async fn run_turn(&mut self, input: &str) -> Result<String, SessionError> {
        self.conversation.push_user(input);
        let mut rounds = 0u32;

        loop {
            self.state = SessionState::ModelThinking;
            let output = self
                .model
                .complete(self.conversation.turns(), &self.catalog)
                .await?;

            if output.tool_calls.is_empty() {
                return Ok(self.respond(output.text));
            }

            rounds += 1;
            if rounds > self.config.max_tool_rounds {
                warn!(rounds, limit = self.config.max_tool_rounds, "tool round limit exceeded");
                let answer = if output.text.is_empty() {
                    TRUNCATION_NOTICE.to_string()
                } else {
                    format!("{}\n{TRUNCATION_NOTICE}", output.text)
                };
                return Ok(self.respond(answer));
            }

            if !output.text.is_empty() {
                self.conversation.push_model_text(output.text);
            }

            self.state = SessionState::ToolDispatch;
            for directive in output.tool_calls {
                let request =
                    ToolCallRequest::new(CallId::generate(), directive.name, directive.arguments);
                self.conversation.push_tool_call(request.clone());
                let result = self.call_tool(request).await?;
                self.conversation.push_tool_result(result);
            }
        }
    }

    fn respond(&mut self, text: String) -> String {
        self.state = SessionState::RespondingToUser;
        self.conversation.push_model_text(text.clone());
        self.state = SessionState::AwaitingUserInput;
        text
    }

    async fn call_tool(&mut self, request: ToolCallRequest) -> Result<ToolCallResult, SessionError> {
        let id = request.id.clone();
        debug!(id = %id, tool = %request.name, "dispatching tool call");

        self.issue(&id)?;
        self.connection
            .send(codec::encode(&Message::ToolCall(request)))
            .await?;

        match self.await_reply(&id).await? {
            Reply::ToolResult(result) => Ok(result),
            Reply::ToolList(_) => Err(SessionError::Protocol(format!(
                "`{id}` was answered with a tool list"
            ))),
        }
    }

    fn issue(&mut self, id: &CallId) -> Result<(), SessionError> {
        self.pending
            .issue(id.clone())
            .map_err(|err| SessionError::Protocol(err.to_string()))
    }

    /// Reads frames until the reply for `id` arrives or the reply deadline passes.
    async fn await_reply(&mut self, id: &CallId) -> Result<Reply, SessionError> {
        // `None` when the timeout is too large to represent: wait without a deadline.
        let deadline = Instant::now().checked_add(self.config.reply_timeout);

        loop {
            if let Some(reply) = self.pending.take(id) {
                return Ok(reply);
            }

            let frame = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, self.connection.receive())
                    .await
                    .map_err(|_| TransportError::Timeout)??,
                None => self.connection.receive().await?,
            };

            let message = match codec::decode(&frame) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "dropping malformed frame from server");
                    continue;
                }
            };

            let resolved = match message {
                Message::ToolResult(result) => {
                    self.pending.resolve(result.id.clone(), Reply::ToolResult(result))
                }
                Message::ToolList { id, tools } => self.pending.resolve(id, Reply::ToolList(tools)),
                Message::Text { content } => {
                    info!(notice = %content, "server notice");
                    Ok(())
                }
                other => {
                    warn!(kind = other.kind(), "ignoring unexpected message from server");
                    Ok(())
                }
            };

            if let Err(err) = resolved {
                warn!(error = %err, "rejecting reply");
            }
        }
    }
}
