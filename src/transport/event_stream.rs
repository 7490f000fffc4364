//! Client side of the HTTP + Server-Sent-Events transport
//!
//! `GET {base}/sse` opens a session-scoped stream whose first event names the
//! POST endpoint for that session. Outbound frames are POSTed one per request;
//! inbound frames arrive as `message` events. A stream that ends without a
//! `close` event is reconnected, and requests that were awaiting a reply at
//! that moment are reported once as lost.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::stream::{BoxStream, StreamExt};
use reqwest::{header, StatusCode};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::TransportError;
use crate::mcp::codec;
use crate::mcp::types::CallId;
use crate::transport::{Connection, Transport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SIGNAL_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct EventStreamConfig {
    pub base_url: Url,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl EventStreamConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(250),
        }
    }

    pub fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_delay = delay;
        self
    }

    fn stream_url(&self) -> Result<Url, TransportError> {
        self.base_url
            .join("sse")
            .map_err(|err| TransportError::broken(format!("invalid server url: {err}")))
    }
}

pub struct EventStreamTransport {
    config: EventStreamConfig,
    client: reqwest::Client,
}

impl EventStreamTransport {
    pub fn new(config: EventStreamConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|err| TransportError::broken(format!("failed to build HTTP client: {err}")))?;

        Ok(Self { config, client })
    }

    pub async fn connect(&self) -> Result<EventStreamConnection, TransportError> {
        let stream_url = self.config.stream_url()?;
        let (endpoint, reader) = open_stream(&self.client, &stream_url).await?;
        info!(stream = %stream_url, endpoint = %endpoint, "event stream connected");

        let endpoint = Arc::new(RwLock::new(endpoint));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_BUFFER);
        let pump = StreamPump {
            client: self.client.clone(),
            config: self.config.clone(),
            stream_url,
            endpoint: Arc::clone(&endpoint),
            in_flight: Arc::clone(&in_flight),
            signals: signals_tx,
        };

        Ok(EventStreamConnection {
            client: self.client.clone(),
            endpoint,
            signals: Mutex::new(signals_rx),
            inline_replies: Mutex::new(VecDeque::new()),
            in_flight,
            reader: tokio::spawn(pump.run(reader)),
        })
    }
}

#[async_trait]
impl Transport for EventStreamTransport {
    async fn open(&self) -> Result<Box<dyn Connection>, TransportError> {
        Ok(Box::new(self.connect().await?))
    }
}

#[derive(Debug)]
enum StreamSignal {
    Frame(Vec<u8>),
    /// Requests that were awaiting a reply when the stream was re-established.
    Reconnected(Vec<CallId>),
    Closed,
    Broken(String),
}

type EventReader = BoxStream<'static, Result<Event, EventStreamError<reqwest::Error>>>;

/// Opens the stream and waits for the session's POST endpoint.
async fn open_stream(
    client: &reqwest::Client,
    stream_url: &Url,
) -> Result<(Url, EventReader), TransportError> {
    let response = client
        .get(stream_url.clone())
        .header(header::ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|err| TransportError::broken(format!("failed to open event stream: {err}")))?;

    if !response.status().is_success() {
        return Err(TransportError::broken(format!(
            "event stream rejected with HTTP {}",
            response.status()
        )));
    }

    let mut reader: EventReader = response.bytes_stream().eventsource().boxed();
    let endpoint = tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            match reader.next().await {
                Some(Ok(event)) if event.event == "endpoint" => return Ok(event.data),
                Some(Ok(event)) => debug!(event = %event.event, "event before endpoint ignored"),
                Some(Err(err)) => return Err(TransportError::broken(err.to_string())),
                None => {
                    return Err(TransportError::broken(
                        "event stream ended before announcing its endpoint",
                    ))
                }
            }
        }
    })
    .await
    .map_err(|_| TransportError::broken("timed out waiting for the endpoint event"))??;

    let endpoint = stream_url
        .join(endpoint.trim())
        .map_err(|err| TransportError::broken(format!("invalid endpoint `{endpoint}`: {err}")))?;

    Ok((endpoint, reader))
}

fn reply_id(frame: &[u8]) -> Option<CallId> {
    codec::decode(frame).ok()?.reply_id().cloned()
}

/// Owns the inbound stream: forwards frames, reconnects after drops.
struct StreamPump {
    client: reqwest::Client,
    config: EventStreamConfig,
    stream_url: Url,
    endpoint: Arc<RwLock<Url>>,
    in_flight: Arc<Mutex<HashSet<CallId>>>,
    signals: mpsc::Sender<StreamSignal>,
}

impl StreamPump {
    async fn run(self, mut reader: EventReader) {
        loop {
            let reason = loop {
                match reader.next().await {
                    Some(Ok(event)) => match event.event.as_str() {
                        "message" => {
                            let frame = event.data.into_bytes();
                            if let Some(id) = reply_id(&frame) {
                                self.in_flight.lock().await.remove(&id);
                            }
                            if self.signals.send(StreamSignal::Frame(frame)).await.is_err() {
                                return;
                            }
                        }
                        "close" => {
                            info!("event stream closed by server");
                            let _ = self.signals.send(StreamSignal::Closed).await;
                            return;
                        }
                        "endpoint" => match self.stream_url.join(event.data.trim()) {
                            Ok(url) => *self.endpoint.write().await = url,
                            Err(err) => warn!(error = %err, "ignoring invalid endpoint event"),
                        },
                        other => debug!(event = %other, "ignoring unknown event"),
                    },
                    Some(Err(err)) => break err.to_string(),
                    None => break "stream ended without close".to_string(),
                }
            };

            warn!(reason = %reason, "event stream dropped, reconnecting");
            match self.reconnect().await {
                Ok((endpoint, next)) => {
                    *self.endpoint.write().await = endpoint.clone();
                    reader = next;

                    let mut lost: Vec<CallId> = self.in_flight.lock().await.drain().collect();
                    lost.sort();
                    info!(endpoint = %endpoint, lost = lost.len(), "event stream reconnected");
                    if lost.is_empty() {
                        continue;
                    }
                    if self.signals.send(StreamSignal::Reconnected(lost)).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = self.signals.send(StreamSignal::Broken(err.to_string())).await;
                    return;
                }
            }
        }
    }

    async fn reconnect(&self) -> Result<(Url, EventReader), TransportError> {
        let attempts = self.config.reconnect_attempts;
        let mut last_error = TransportError::broken("reconnection disabled");

        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.reconnect_delay * attempt).await;
            match open_stream(&self.client, &self.stream_url).await {
                Ok(opened) => return Ok(opened),
                Err(err) => {
                    warn!(attempt, attempts, error = %err, "reconnect attempt failed");
                    last_error = err;
                }
            }
        }

        Err(TransportError::broken(format!(
            "could not re-establish event stream after {attempts} attempt(s): {last_error}"
        )))
    }
}

pub struct EventStreamConnection {
    client: reqwest::Client,
    endpoint: Arc<RwLock<Url>>,
    signals: Mutex<mpsc::Receiver<StreamSignal>>,
    inline_replies: Mutex<VecDeque<Vec<u8>>>,
    in_flight: Arc<Mutex<HashSet<CallId>>>,
    reader: JoinHandle<()>,
}

impl EventStreamConnection {
    pub async fn endpoint(&self) -> Url {
        self.endpoint.read().await.clone()
    }

    async fn settle(&self, frame: &[u8]) {
        if let Some(id) = reply_id(frame) {
            self.in_flight.lock().await.remove(&id);
        }
    }

    async fn forget(&self, id: Option<&CallId>) {
        if let Some(id) = id {
            self.in_flight.lock().await.remove(id);
        }
    }
}

#[async_trait]
impl Connection for EventStreamConnection {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let request_id = codec::decode(&frame)
            .ok()
            .and_then(|message| message.request_id().cloned());
        if let Some(id) = &request_id {
            self.in_flight.lock().await.insert(id.clone());
        }

        let endpoint = self.endpoint().await;
        let response = match self
            .client
            .post(endpoint)
            .header(header::CONTENT_TYPE, "application/json")
            .body(frame)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                self.forget(request_id.as_ref()).await;
                return Err(TransportError::broken(format!("failed to post frame: {err}")));
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            self.forget(request_id.as_ref()).await;
            return Err(match request_id {
                Some(id) => TransportError::LostInFlight(vec![id]),
                None => TransportError::broken("session no longer known to the server"),
            });
        }
        if !status.is_success() {
            self.forget(request_id.as_ref()).await;
            return Err(TransportError::broken(format!(
                "server rejected frame with HTTP {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::broken(format!("failed to read response: {err}")))?;
        if body.iter().any(|byte| !byte.is_ascii_whitespace()) {
            self.inline_replies.lock().await.push_back(body.to_vec());
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        if let Some(frame) = self.inline_replies.lock().await.pop_front() {
            self.settle(&frame).await;
            return Ok(frame);
        }

        match self.signals.lock().await.recv().await {
            Some(StreamSignal::Frame(frame)) => Ok(frame),
            Some(StreamSignal::Reconnected(lost)) => Err(TransportError::LostInFlight(lost)),
            Some(StreamSignal::Broken(reason)) => Err(TransportError::Broken(reason)),
            Some(StreamSignal::Closed) | None => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.reader.abort();
        self.signals.lock().await.close();
    }
}

impl Drop for EventStreamConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
