//! Transports carrying protocol frames between a client session and a server
//!
//! Both the session loop and the dispatcher only see [`Connection`]; the pipe and
//! event-stream variants differ in how frames are moved, not in what they carry.

use async_trait::async_trait;

use crate::errors::TransportError;

pub mod event_stream;
pub mod pipe;

pub use event_stream::{EventStreamConfig, EventStreamTransport};
pub use pipe::{PipeConnection, PipeTransport};

#[async_trait]
pub trait Connection: Send + Sync {
    /// Sends one encoded frame. The trailing delimiter is added when missing.
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Waits for the next complete frame, without its delimiter.
    async fn receive(&self) -> Result<Vec<u8>, TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Connection>, TransportError>;
}
