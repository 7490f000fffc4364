use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;
use url::Url;

use crate::session::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTransport {
    Stdio,
    Sse,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: ServerTransport,
    pub bind_addr: String,
    pub bind_port: u16,
    pub max_concurrent_calls: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTransport {
    /// Spawn the server and talk to it over its stdio.
    Pipe { program: String, args: Vec<String> },
    EventStream { base_url: Url },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: ClientTransport,
    pub reply_timeout: Duration,
    pub max_tool_rounds: u32,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MCP_TRANSPORT must be `stdio` or `sse`")]
    InvalidTransport,
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("invalid bind address or port")]
    InvalidSocket,
    #[error("{0} must be a positive integer")]
    InvalidNumber(&'static str),
    #[error("MCP_SERVER_URL must be an absolute http(s) url")]
    InvalidServerUrl,
    #[error("MCP_REPLY_TIMEOUT_SECS must not exceed {MAX_REPLY_TIMEOUT_SECS}")]
    ReplyTimeoutTooLarge,
}

/// One day. Longer waits are indistinguishable from a hung server.
pub const MAX_REPLY_TIMEOUT_SECS: u64 = 86_400;

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match non_empty(lookup, key) {
        None => Ok(default),
        Some(value) => value
            .parse::<T>()
            .ok()
            .filter(|parsed| *parsed > T::default())
            .ok_or(ConfigError::InvalidNumber(key)),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let transport = match non_empty(&lookup, "MCP_TRANSPORT")
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("sse") => ServerTransport::Sse,
            Some("stdio") => ServerTransport::Stdio,
            Some(_) => return Err(ConfigError::InvalidTransport),
        };

        let bind_addr = non_empty(&lookup, "BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = non_empty(&lookup, "BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(5553);
        let max_concurrent_calls = positive(&lookup, "MCP_MAX_CONCURRENT_CALLS", 16usize)?;

        let config = Self {
            transport,
            bind_addr,
            bind_port,
            max_concurrent_calls,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // The command is split on whitespace; quoting is not supported.
        let command = non_empty(&lookup, "MCP_SERVER_COMMAND").and_then(|command| {
            let mut parts = command.split_whitespace().map(str::to_string);
            let program = parts.next()?;
            Some(ClientTransport::Pipe {
                program,
                args: parts.collect(),
            })
        });

        let transport = match command {
            Some(pipe) => pipe,
            None => {
                let raw = non_empty(&lookup, "MCP_SERVER_URL")
                    .unwrap_or_else(|| "http://127.0.0.1:5553".to_string());
                let base_url = Url::parse(&raw).map_err(|_| ConfigError::InvalidServerUrl)?;
                if !matches!(base_url.scheme(), "http" | "https") {
                    return Err(ConfigError::InvalidServerUrl);
                }
                ClientTransport::EventStream { base_url }
            }
        };

        let reply_timeout_secs = positive(&lookup, "MCP_REPLY_TIMEOUT_SECS", 60u64)?;
        if reply_timeout_secs > MAX_REPLY_TIMEOUT_SECS {
            return Err(ConfigError::ReplyTimeoutTooLarge);
        }
        let max_tool_rounds = positive(&lookup, "MCP_MAX_TOOL_ROUNDS", 8u32)?;
        let reconnect_attempts = match non_empty(&lookup, "MCP_RECONNECT_ATTEMPTS") {
            None => 3,
            Some(value) => value
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidNumber("MCP_RECONNECT_ATTEMPTS"))?,
        };

        Ok(Self {
            transport,
            reply_timeout: Duration::from_secs(reply_timeout_secs),
            max_tool_rounds,
            reconnect_attempts,
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            reply_timeout: self.reply_timeout,
            max_tool_rounds: self.max_tool_rounds,
        }
    }
}
