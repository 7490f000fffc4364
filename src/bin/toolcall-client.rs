use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use toolcall_mcp::{
    config::{ClientConfig, ClientTransport},
    logging,
    session::{model::CommandModel, Session},
    transport::{Connection, EventStreamConfig, EventStreamTransport, PipeTransport, Transport},
};
use tracing::info;

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = ClientConfig::from_env()?;
    let connection: Box<dyn Connection> = match &config.transport {
        ClientTransport::Pipe { program, args } => {
            PipeTransport::command(program.as_str())
                .args(args.iter().cloned())
                .open()
                .await?
        }
        ClientTransport::EventStream { base_url } => {
            let stream_config = EventStreamConfig::new(base_url.clone())
                .with_reconnect(config.reconnect_attempts, RECONNECT_DELAY);
            EventStreamTransport::new(stream_config)?.open().await?
        }
    };

    let mut session =
        Session::start(connection, Arc::new(CommandModel), config.session_config()).await?;
    info!(tools = session.catalog().len(), "connected to tool server");

    let names: Vec<&str> = session.catalog().iter().map(|tool| tool.name.as_str()).collect();
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("tools: {}\n", names.join(", ")).as_bytes())
        .await?;
    stdout.flush().await?;

    session
        .run(BufReader::new(tokio::io::stdin()), stdout)
        .await?;
    Ok(())
}
