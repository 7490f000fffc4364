//! Newline-delimited frames over a duplex byte stream
//!
//! Used for child-process stdio, the server's own stdin/stdout and in-memory
//! pairs in tests. Frames are strictly FIFO in each direction.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::TransportError;
use crate::mcp::codec::FRAME_DELIMITER;
use crate::transport::{Connection, Transport};

const PAIR_BUFFER_BYTES: usize = 64 * 1024;

type FrameReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct PipeConnection {
    reader: Mutex<FrameReader>,
    writer: Mutex<FrameWriter>,
    child: Mutex<Option<Child>>,
}

impl PipeConnection {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(BufReader::new(Box::new(reader))),
            writer: Mutex::new(Box::new(writer)),
            child: Mutex::new(None),
        }
    }

    /// The current process's stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Two connections wired to each other in memory.
    pub fn pair() -> (Self, Self) {
        let (left, right) = tokio::io::duplex(PAIR_BUFFER_BYTES);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        (
            Self::new(left_read, left_write),
            Self::new(right_read, right_write),
        )
    }

    fn with_child(mut self, child: Child) -> Self {
        self.child = Mutex::new(Some(child));
        self
    }
}

#[async_trait]
impl Connection for PipeConnection {
    async fn send(&self, mut frame: Vec<u8>) -> Result<(), TransportError> {
        if frame.last() != Some(&FRAME_DELIMITER) {
            frame.push(FRAME_DELIMITER);
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|err| TransportError::broken(format!("write failed: {err}")))?;
        writer
            .flush()
            .await
            .map_err(|err| TransportError::broken(format!("flush failed: {err}")))
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let mut reader = self.reader.lock().await;
        loop {
            let mut line = Vec::new();
            let read = reader
                .read_until(FRAME_DELIMITER, &mut line)
                .await
                .map_err(|err| TransportError::broken(format!("read failed: {err}")))?;

            if read == 0 {
                return Err(TransportError::Closed);
            }
            if line.last() != Some(&FRAME_DELIMITER) {
                return Err(TransportError::broken("stream ended inside a frame"));
            }

            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(line);
        }
    }

    async fn close(&self) {
        if let Err(err) = self.writer.lock().await.shutdown().await {
            debug!(error = %err, "pipe writer shutdown failed");
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                debug!(error = %err, "failed to stop server process");
            }
        }
    }
}

/// Spawns a tool server as a child process and talks to it over its stdio.
#[derive(Debug, Clone)]
pub struct PipeTransport {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl PipeTransport {
    pub fn command(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn open(&self) -> Result<Box<dyn Connection>, TransportError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            TransportError::broken(format!("failed to spawn `{}`: {err}", self.program))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::broken("failed to capture child stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::broken("failed to capture child stdout"))?;

        info!(program = %self.program, pid = ?child.id(), "spawned tool server");
        Ok(Box::new(PipeConnection::new(stdout, stdin).with_child(child)))
    }
}
