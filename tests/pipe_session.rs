//! Session loop scenarios over the in-memory pipe transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;

use toolcall_mcp::errors::TransportError;
use toolcall_mcp::mcp::codec;
use toolcall_mcp::mcp::types::{CallId, Message, ToolCallRequest, ToolCallResult, ToolDescriptor};
use toolcall_mcp::session::conversation::{Role, TurnContent};
use toolcall_mcp::session::model::{CommandModel, ModelOutput, ToolCallDirective};
use toolcall_mcp::session::{Session, SessionConfig, SessionError, SessionState, TRUNCATION_NOTICE};
use toolcall_mcp::transport::{Connection, PipeConnection};

use common::{pipe_server, session_config, test_registry, ScriptedModel};

async fn expect_message(connection: &PipeConnection) -> Message {
    let frame = tokio::time::timeout(Duration::from_secs(5), connection.receive())
        .await
        .expect("frame before timeout")
        .expect("frame");
    codec::decode(&frame).expect("decode")
}

async fn reply(connection: &PipeConnection, message: Message) {
    connection
        .send(codec::encode(&message))
        .await
        .expect("send reply");
}

/// Answers the catalog request with `tools`.
async fn answer_listing(server: &PipeConnection, tools: Vec<ToolDescriptor>) {
    let Message::ListTools { id } = expect_message(server).await else {
        panic!("expected list_tools first");
    };
    reply(server, Message::ToolList { id, tools }).await;
}

async fn expect_tool_call(server: &PipeConnection) -> ToolCallRequest {
    match expect_message(server).await {
        Message::ToolCall(request) => request,
        other => panic!("expected tool call, got {other:?}"),
    }
}

#[tokio::test]
async fn summarize_call_is_folded_into_history() {
    let model = ScriptedModel::new(vec![
        ModelOutput::tool_calls(vec![ToolCallDirective::new(
            "summarize_document",
            json!({"document_content": "Methane fell. Jobs rose. Costs dropped. Output grew."}),
        )]),
        ModelOutput::text("The document reports falling methane."),
    ]);
    let connection = pipe_server(test_registry(Arc::new(Notify::new())));

    let mut session = Session::start(connection, model.clone(), session_config())
        .await
        .expect("session start");
    assert_eq!(session.catalog().len(), 4);

    let answer = session
        .handle_user_input("summarize this")
        .await
        .expect("answer");
    assert_eq!(answer, "The document reports falling methane.");
    assert_eq!(session.state(), SessionState::AwaitingUserInput);
    assert_eq!(model.calls(), 2);

    let turns = session.conversation().turns();
    let roles: Vec<Role> = turns.iter().map(|turn| turn.role).collect();
    assert_eq!(roles, [Role::User, Role::Model, Role::Tool, Role::Model]);

    let TurnContent::ToolResult(result) = &turns[2].content else {
        panic!("expected tool result turn");
    };
    assert!(!result.is_error);
    assert_eq!(
        result.content["summary"],
        "Methane fell. Jobs rose. Costs dropped."
    );

    let second_history = &model.histories()[1];
    assert!(matches!(
        second_history.last().map(|turn| &turn.content),
        Some(TurnContent::ToolResult(_))
    ));
}

#[tokio::test]
async fn unknown_tool_yields_error_result_and_loop_continues() {
    let model = ScriptedModel::new(vec![
        ModelOutput::tool_calls(vec![ToolCallDirective::new("fetch_bitcoin_price", json!({}))]),
        ModelOutput::text("That tool is not available."),
    ]);
    let connection = pipe_server(test_registry(Arc::new(Notify::new())));
    let mut session = Session::start(connection, model.clone(), session_config())
        .await
        .expect("session start");

    let answer = session.handle_user_input("price?").await.expect("answer");
    assert_eq!(answer, "That tool is not available.");

    let TurnContent::ToolResult(result) = &session.conversation().turns()[2].content else {
        panic!("expected tool result turn");
    };
    assert!(result.is_error);
    assert!(result.text().contains("unknown tool"));
    assert_eq!(session.state(), SessionState::AwaitingUserInput);
}

#[tokio::test]
async fn directives_are_dispatched_one_at_a_time_in_order() {
    let (client, server) = PipeConnection::pair();
    let model = ScriptedModel::new(vec![
        ModelOutput::tool_calls(vec![
            ToolCallDirective::new("first", json!({"n": 1})),
            ToolCallDirective::new("second", json!({"n": 2})),
        ]),
        ModelOutput::text("both done"),
    ]);

    let session_task = tokio::spawn({
        let model = model.clone();
        async move {
            let mut session = Session::start(Box::new(client), model, session_config())
                .await
                .expect("session start");
            let answer = session.handle_user_input("go").await;
            (session, answer)
        }
    });

    answer_listing(
        &server,
        vec![
            ToolDescriptor::new("first", json!({})),
            ToolDescriptor::new("second", json!({})),
        ],
    )
    .await;

    let first = expect_tool_call(&server).await;
    assert_eq!(first.name, "first");
    assert!(
        tokio::time::timeout(Duration::from_millis(150), server.receive())
            .await
            .is_err(),
        "second call must wait for the first result"
    );
    reply(
        &server,
        Message::ToolResult(ToolCallResult::success(first.id.clone(), json!("A"))),
    )
    .await;

    let second = expect_tool_call(&server).await;
    assert_eq!(second.name, "second");
    assert_ne!(second.id, first.id);
    reply(
        &server,
        Message::ToolResult(ToolCallResult::success(second.id.clone(), json!("B"))),
    )
    .await;

    let (session, answer) = session_task.await.expect("join");
    assert_eq!(answer.expect("answer"), "both done");

    let contents: Vec<String> = session
        .conversation()
        .turns()
        .iter()
        .map(|turn| match &turn.content {
            TurnContent::Text { text } => format!("text:{text}"),
            TurnContent::ToolCall(request) => format!("call:{}", request.name),
            TurnContent::ToolResult(result) => format!("result:{}", result.text()),
        })
        .collect();
    assert_eq!(
        contents,
        [
            "text:go",
            "call:first",
            "result:A",
            "call:second",
            "result:B",
            "text:both done"
        ]
    );
}

#[tokio::test]
async fn unmatched_results_and_notices_stay_out_of_history() {
    let (client, server) = PipeConnection::pair();
    let model = ScriptedModel::new(vec![
        ModelOutput::tool_calls(vec![ToolCallDirective::new("first", json!({}))]),
        ModelOutput::text("ok"),
    ]);

    let session_task = tokio::spawn(async move {
        let mut session = Session::start(Box::new(client), model, session_config())
            .await
            .expect("session start");
        let answer = session.handle_user_input("go").await;
        (session, answer)
    });

    answer_listing(&server, vec![ToolDescriptor::new("first", json!({}))]).await;
    let request = expect_tool_call(&server).await;

    reply(
        &server,
        Message::ToolResult(ToolCallResult::success(CallId::from("ghost"), json!("wrong"))),
    )
    .await;
    reply(
        &server,
        Message::Text {
            content: "maintenance at noon".to_string(),
        },
    )
    .await;
    server.send(b"{not json".to_vec()).await.expect("send garbage");
    reply(
        &server,
        Message::ToolResult(ToolCallResult::success(request.id.clone(), json!("right"))),
    )
    .await;

    let (session, answer) = session_task.await.expect("join");
    assert_eq!(answer.expect("answer"), "ok");
    assert_eq!(session.outstanding_requests(), 0);

    let results: Vec<&ToolCallResult> = session
        .conversation()
        .turns()
        .iter()
        .filter_map(|turn| match &turn.content {
            TurnContent::ToolResult(result) => Some(result),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, request.id);
    assert_eq!(results[0].content, json!("right"));
    assert_eq!(session.conversation().len(), 4);
}

#[tokio::test]
async fn duplicate_catalog_names_keep_the_first() {
    let (client, server) = PipeConnection::pair();
    let model = ScriptedModel::new(vec![]);

    let start = tokio::spawn(async move {
        Session::start(Box::new(client), model, session_config()).await
    });
    answer_listing(
        &server,
        vec![
            ToolDescriptor::new("twin", json!({})).with_description("first"),
            ToolDescriptor::new("other", json!({})),
            ToolDescriptor::new("twin", json!({})).with_description("second"),
        ],
    )
    .await;

    let session = start.await.expect("join").expect("session start");
    let catalog = session.catalog();
    assert_eq!(catalog.len(), 2);
    assert_eq!(catalog[0].description.as_deref(), Some("first"));
}

#[tokio::test]
async fn missing_reply_times_out_and_terminates() {
    let (client, server) = PipeConnection::pair();
    let model = ScriptedModel::new(vec![ModelOutput::tool_calls(vec![ToolCallDirective::new(
        "first",
        json!({}),
    )])]);
    let config = SessionConfig {
        reply_timeout: Duration::from_millis(200),
        max_tool_rounds: 4,
    };

    let session_task = tokio::spawn(async move {
        let mut session = Session::start(Box::new(client), model, config)
            .await
            .expect("session start");
        let first = session.handle_user_input("go").await;
        let second = session.handle_user_input("again").await;
        (session, first, second)
    });

    answer_listing(&server, vec![ToolDescriptor::new("first", json!({}))]).await;
    let _ignored = expect_tool_call(&server).await;

    let (session, first, second) = session_task.await.expect("join");
    let error = first.expect_err("timeout");
    assert!(matches!(
        error,
        SessionError::Transport(TransportError::Timeout)
    ));
    assert!(error.user_message().contains("did not answer in time"));
    assert!(matches!(second, Err(SessionError::Terminated)));
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn unrepresentable_reply_timeout_waits_without_deadline() {
    let model = ScriptedModel::new(vec![
        ModelOutput::tool_calls(vec![ToolCallDirective::new(
            "slow_echo",
            json!({"delay_ms": 10}),
        )]),
        ModelOutput::text("still here"),
    ]);
    let config = SessionConfig {
        reply_timeout: Duration::from_secs(u64::MAX),
        max_tool_rounds: 4,
    };

    let connection = pipe_server(test_registry(Arc::new(Notify::new())));
    let mut session = Session::start(connection, model, config)
        .await
        .expect("session start");

    let answer = session.handle_user_input("go").await.expect("answer");
    assert_eq!(answer, "still here");
    assert_eq!(session.state(), SessionState::AwaitingUserInput);
}

#[tokio::test]
async fn server_going_away_during_start_is_closed() {
    let (client, server) = PipeConnection::pair();
    let model = ScriptedModel::new(vec![]);

    let start = tokio::spawn(async move {
        Session::start(Box::new(client), model, session_config()).await
    });
    let Message::ListTools { .. } = expect_message(&server).await else {
        panic!("expected list_tools");
    };
    drop(server);

    let error = start.await.expect("join").err().expect("start should fail");
    assert!(matches!(error, SessionError::Transport(TransportError::Closed)));
}

#[tokio::test]
async fn runaway_tool_loop_is_truncated() {
    let directive = || {
        ModelOutput::tool_calls(vec![ToolCallDirective::new(
            "slow_echo",
            json!({"again": true}),
        )])
    };
    let model = ScriptedModel::new((0..5).map(|_| directive()).collect());
    let connection = pipe_server(test_registry(Arc::new(Notify::new())));
    let mut session = Session::start(connection, model.clone(), session_config())
        .await
        .expect("session start");

    let answer = session.handle_user_input("loop").await.expect("answer");
    assert_eq!(answer, TRUNCATION_NOTICE);
    assert_eq!(model.calls(), 5);

    let tool_results = session
        .conversation()
        .turns()
        .iter()
        .filter(|turn| turn.role == Role::Tool)
        .count();
    assert_eq!(tool_results, 4);
    assert_eq!(session.state(), SessionState::AwaitingUserInput);
}

#[tokio::test]
async fn model_errors_leave_the_session_usable() {
    let connection = pipe_server(test_registry(Arc::new(Notify::new())));
    let mut session = Session::start(connection, Arc::new(CommandModel), session_config())
        .await
        .expect("session start");

    let error = session
        .handle_user_input("/test_regex [1, 2]")
        .await
        .expect_err("bad arguments");
    assert!(!error.is_fatal());
    assert_eq!(session.state(), SessionState::AwaitingUserInput);

    let answer = session
        .handle_user_input(
            r#"/test_regex {"regex_pattern": "\\d+", "text_to_search": "order 42", "answer_text": "42"}"#,
        )
        .await
        .expect("answer");
    assert!(answer.starts_with("test_regex returned:"));
    assert!(answer.contains("\"verified\":true"));
}

#[tokio::test]
async fn console_loop_prints_answers_until_quit() {
    let connection = pipe_server(test_registry(Arc::new(Notify::new())));
    let mut session = Session::start(connection, Arc::new(CommandModel), session_config())
        .await
        .expect("session start");

    let input = b"hello\n\n/test_regex [oops]\n/slow_echo {\"word\": \"hi\"}\nquit\nnever read\n";
    let mut output = Vec::new();
    session.run(&input[..], &mut output).await.expect("run");

    let output = String::from_utf8(output).expect("utf8");
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("assistant: available tools: summarize_document"));
    assert!(lines[1].starts_with("error: the model could not answer"));
    assert_eq!(lines[2], r#"assistant: slow_echo returned: {"word":"hi"}"#);
    assert_eq!(session.state(), SessionState::Terminated);
}
