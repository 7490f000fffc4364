//! Session-scoped event streams on the server side
//!
//! Every `GET /sse` opens one session. POSTed frames for that session are fed
//! to its dispatcher through an inbound channel; the dispatcher's replies go
//! through an outbound channel consumed by exactly one SSE writer. Dropping the
//! stream removes the session.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use axum::response::sse::Event;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::TransportError;
use crate::transport::Connection;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Emit `close` so the client knows the session ended on purpose.
    Graceful,
    /// End the stream without `close`; clients treat this as a dropped connection.
    Abort,
}

struct SessionEntry {
    inbound: mpsc::Sender<Vec<u8>>,
    terminate: oneshot::Sender<Termination>,
}

#[derive(Clone, Default)]
pub struct SessionHub {
    sessions: Arc<Mutex<HashMap<Uuid, SessionEntry>>>,
}

pub struct OpenedSession {
    pub id: Uuid,
    pub connection: SseServerConnection,
    pub events: SessionEvents,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open_session(&self) -> OpenedSession {
        let id = Uuid::new_v4();
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (terminate_tx, terminate_rx) = oneshot::channel();

        self.entries().insert(
            id,
            SessionEntry {
                inbound: inbound_tx,
                terminate: terminate_tx,
            },
        );
        info!(session_id = %id, "session opened");

        OpenedSession {
            id,
            connection: SseServerConnection {
                inbound: tokio::sync::Mutex::new(inbound_rx),
                outbound: outbound_tx,
            },
            events: SessionEvents {
                id,
                outbound: outbound_rx,
                terminate: terminate_rx,
                guard: SessionGuard {
                    id,
                    hub: self.clone(),
                },
            },
        }
    }

    /// Hands a frame to the session's dispatcher. `false` when the session is unknown.
    pub async fn deliver(&self, id: Uuid, frame: Vec<u8>) -> bool {
        let inbound = match self.entries().get(&id) {
            Some(entry) => entry.inbound.clone(),
            None => return false,
        };
        inbound.send(frame).await.is_ok()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn abort(&self, id: Uuid) -> bool {
        self.terminate(id, Termination::Abort)
    }

    pub fn close_all(&self) -> usize {
        self.terminate_all(Termination::Graceful)
    }

    pub fn abort_all(&self) -> usize {
        self.terminate_all(Termination::Abort)
    }

    fn terminate(&self, id: Uuid, termination: Termination) -> bool {
        let entry = self.entries().remove(&id);
        match entry {
            Some(entry) => {
                let _ = entry.terminate.send(termination);
                true
            }
            None => false,
        }
    }

    fn terminate_all(&self, termination: Termination) -> usize {
        let drained: Vec<(Uuid, SessionEntry)> = self.entries().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            debug!(session_id = %id, ?termination, "terminating session");
            let _ = entry.terminate.send(termination);
        }
        count
    }

    fn remove(&self, id: Uuid) {
        if self.entries().remove(&id).is_some() {
            info!(session_id = %id, "session stream dropped");
        }
    }
}

/// Removes the session once its stream is gone.
struct SessionGuard {
    id: Uuid,
    hub: SessionHub,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.hub.remove(self.id);
    }
}

/// The dispatcher's view of one event-stream session.
pub struct SseServerConnection {
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl Connection for SseServerConnection {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    async fn close(&self) {
        self.inbound.lock().await.close();
    }
}

pub struct SessionEvents {
    id: Uuid,
    outbound: mpsc::Receiver<Vec<u8>>,
    terminate: oneshot::Receiver<Termination>,
    guard: SessionGuard,
}

enum Next {
    Frame(Vec<u8>),
    Finish(Option<Termination>),
}

impl SessionEvents {
    pub fn endpoint(&self) -> String {
        format!("/messages?session_id={}", self.id)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Event, Infallible>> + Send {
        let endpoint = self.endpoint();
        let SessionEvents {
            mut outbound,
            mut terminate,
            guard,
            ..
        } = self;

        async_stream::stream! {
            let _guard = guard;
            yield Ok(Event::default().event("endpoint").data(endpoint));

            loop {
                let next = tokio::select! {
                    biased;
                    frame = outbound.recv() => match frame {
                        Some(frame) => Next::Frame(frame),
                        None => Next::Finish(None),
                    },
                    termination = &mut terminate => Next::Finish(termination.ok()),
                };

                match next {
                    Next::Frame(frame) => {
                        let data = String::from_utf8_lossy(&frame).trim_end().to_string();
                        yield Ok(Event::default().event("message").data(data));
                    }
                    Next::Finish(Some(Termination::Graceful)) => {
                        yield Ok(Event::default().event("close").data("session closed"));
                        break;
                    }
                    Next::Finish(_) => break,
                }
            }
        }
    }
}
