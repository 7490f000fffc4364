use std::sync::Arc;

use tokio::net::TcpListener;
use toolcall_mcp::{
    config::{ServerConfig, ServerTransport},
    domain::tools::default_registry,
    logging,
    mcp::dispatcher::Dispatcher,
    serve_event_stream,
    transport::PipeConnection,
    AppState,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = ServerConfig::from_env()?;
    let registry = Arc::new(default_registry()?);

    match config.transport {
        ServerTransport::Stdio => {
            info!(tools = registry.len(), "serving over stdio");
            Dispatcher::new(registry, config.max_concurrent_calls)
                .serve(Arc::new(PipeConnection::stdio()))
                .await?;
        }
        ServerTransport::Sse => {
            let bind_socket = config.bind_socket()?;
            let state = AppState::new(registry, config.max_concurrent_calls);
            let listener = TcpListener::bind(bind_socket).await?;

            info!(
                bind_addr = %config.bind_addr,
                bind_port = config.bind_port,
                max_concurrent_calls = config.max_concurrent_calls,
                "server starting"
            );

            serve_event_stream(listener, state, shutdown_signal()).await?;
        }
    }

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
