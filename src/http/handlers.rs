//! Axum HTTP handlers for the event-stream surface
//!
//! `GET /sse` opens a session stream, `POST /messages` feeds frames into it, plus
//! the health and discovery metadata endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::errors::AppError;
use crate::http::hub::OpenedSession;
use crate::mcp::codec;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub sse_endpoint: &'static str,
    pub message_endpoint: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub session_id: Uuid,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn discovery() -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        sse_endpoint: "/sse",
        message_endpoint: "/messages",
    })
}

pub async fn sse_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let OpenedSession {
        id,
        connection,
        events,
    } = state.sessions.open_session();

    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        if let Err(err) = dispatcher.serve(Arc::new(connection)).await {
            warn!(session_id = %id, error = %err, "session dispatcher stopped");
        }
    });

    Sse::new(events.into_stream()).keep_alive(KeepAlive::default())
}

pub async fn post_message(
    State(state): State<AppState>,
    query: Result<Query<MessageQuery>, QueryRejection>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let Query(query) =
        query.map_err(|err| AppError::bad_request("invalid_session_id", err.body_text()))?;
    codec::decode(&body).map_err(|err| AppError::bad_request("malformed_frame", err.to_string()))?;

    if !state.sessions.deliver(query.session_id, body.to_vec()).await {
        return Err(AppError::not_found("session_not_found", "unknown session"));
    }

    Ok(StatusCode::ACCEPTED)
}
