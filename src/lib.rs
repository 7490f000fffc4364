use std::future::Future;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tracing::info;

pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod session;
pub mod transport;

use domain::registry::ToolRegistry;
use http::hub::SessionHub;
use mcp::dispatcher::Dispatcher;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub sessions: SessionHub,
}

impl AppState {
    pub fn new(registry: Arc<ToolRegistry>, max_concurrent_calls: usize) -> Self {
        Self {
            dispatcher: Dispatcher::new(registry, max_concurrent_calls),
            sessions: SessionHub::new(),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .route("/sse", get(http::handlers::sse_endpoint))
        .route("/messages", post(http::handlers::post_message))
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

/// Serves the event-stream surface until `shutdown` resolves, then closes
/// every open session stream so connected clients see a clean close.
pub async fn serve_event_stream<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let sessions = state.sessions.clone();
    axum::serve(listener, build_app(state).into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.await;
            let closed = sessions.close_all();
            info!(sessions = closed, "closing event streams");
        })
        .await
}
