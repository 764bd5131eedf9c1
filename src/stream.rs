//! Notification Stream
//!
//! Keeps one long-lived `text/event-stream` connection to the service.
//! The desired state (`expected`) is kept apart from the physical connection:
//! a reconnect timer re-checks it when it fires, so a `stop()` that lands
//! after the timer was scheduled still wins.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::ACCEPT;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::TokenManager;
use crate::config::ClientConfig;
use crate::events::{ClientEvent, EventSink};
use crate::transport::{browser_headers, HttpRequest, HttpTransport};

/// Physical connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Connecting,
    Open,
}

/// One server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Upper bound on an event still being assembled
const MAX_PENDING_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SseError {
    #[error("Event exceeds 1 MiB without a terminator")]
    Overflow,
}

/// Incremental parser for `text/event-stream` bodies.
///
/// Lines may end in LF, CRLF or a lone CR. A blank line dispatches the event.
#[derive(Default)]
pub struct SseParser {
    line: Vec<u8>,
    event: Option<String>,
    data: Option<String>,
    id: Option<String>,
    /// Last byte was CR; a following LF belongs to the same line break
    after_cr: bool,
}

impl SseParser {
    /// Feed a chunk, returning every event it completed
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, SseError> {
        let mut events = Vec::new();

        for &byte in chunk {
            if std::mem::take(&mut self.after_cr) && byte == b'\n' {
                continue;
            }
            match byte {
                b'\r' => {
                    self.after_cr = true;
                    self.end_line(&mut events);
                }
                b'\n' => self.end_line(&mut events),
                _ => {
                    if self.pending_len() >= MAX_PENDING_BYTES {
                        return Err(SseError::Overflow);
                    }
                    self.line.push(byte);
                }
            }
        }

        Ok(events)
    }

    fn pending_len(&self) -> usize {
        self.line.len() + self.data.as_ref().map_or(0, String::len)
    }

    fn end_line(&mut self, events: &mut Vec<SseEvent>) {
        if self.line.is_empty() {
            let event = self.event.take();
            let id = self.id.take();
            if let Some(data) = self.data.take() {
                events.push(SseEvent { event, data, id });
            }
            return;
        }

        let line = String::from_utf8_lossy(&std::mem::take(&mut self.line)).into_owned();
        let (field, value) = match line.split_once(':') {
            Some(("", _)) => return, // comment / keep-alive
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_str(), ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
    }
}

/// How one connection attempt ended
enum Ended {
    /// Peer closed a healthy stream
    Graceful,
    /// Transport failure or unexpected status
    Failed(String),
    Unauthorized,
    NoToken,
}

struct Inner {
    state: StreamState,
    expected: bool,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

pub struct StreamManager {
    config: Arc<ClientConfig>,
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenManager>,
    events: Arc<dyn EventSink>,
    inner: Mutex<Inner>,
}

impl StreamManager {
    pub fn new(
        config: Arc<ClientConfig>,
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenManager>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            transport,
            tokens,
            events,
            inner: Mutex::new(Inner {
                state: StreamState::Idle,
                expected: false,
                generation: 0,
                task: None,
            }),
        }
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    pub fn is_expected(&self) -> bool {
        self.inner.lock().expected
    }

    /// Open the stream unless it is already running or there is no access token.
    ///
    /// Returns whether a new connection loop was started.
    pub fn start(self: &Arc<Self>) -> bool {
        if !self.tokens.is_authenticated() {
            debug!("Not starting notification stream: no access token");
            return false;
        }

        let mut inner = self.inner.lock();
        if inner.task.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Notification stream already running");
            return false;
        }

        inner.expected = true;
        inner.generation += 1;
        inner.state = StreamState::Connecting;

        let generation = inner.generation;
        let this = Arc::clone(self);
        inner.task = Some(tokio::spawn(async move { this.run(generation).await }));
        true
    }

    /// Stop the stream and cancel any scheduled reconnect
    pub fn stop(&self) {
        let (was_running, task) = {
            let mut inner = self.inner.lock();
            let was_running = inner.expected || inner.task.is_some();
            inner.expected = false;
            inner.state = StreamState::Idle;
            (was_running, inner.task.take())
        };

        if let Some(task) = task {
            task.abort();
        }

        if was_running {
            info!("Notification stream stopped");
            self.events.emit(ClientEvent::StreamStopped);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        inner.expected && inner.generation == generation
    }

    fn set_state(&self, generation: u64, state: StreamState) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation || !inner.expected {
            return false;
        }
        inner.state = state;
        true
    }

    /// Give up on this generation without touching a newer one
    fn finish(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.expected = false;
            inner.state = StreamState::Idle;
            inner.task = None;
        }
    }

    async fn run(self: Arc<Self>, generation: u64) {
        loop {
            if !self.is_current(generation) {
                return;
            }

            let (delay, error) = match self.connect_once(generation).await {
                Ended::Graceful => (self.config.reconnect_delay, None),
                Ended::Failed(e) => {
                    warn!("Notification stream failed: {}", e);
                    (self.config.error_reconnect_delay, Some(e))
                }
                Ended::Unauthorized => match self.tokens.refresh().await {
                    Ok(()) => (self.config.reconnect_delay, None),
                    Err(failure) => {
                        warn!("Notification stream unauthorized and refresh failed: {}", failure);
                        self.finish(generation);
                        self.events.emit(ClientEvent::StreamStopped);
                        return;
                    }
                },
                Ended::NoToken => {
                    debug!("Access token gone, notification stream ends");
                    self.finish(generation);
                    self.events.emit(ClientEvent::StreamStopped);
                    return;
                }
            };

            if !self.set_state(generation, StreamState::Idle) {
                return;
            }
            debug!("Notification stream reconnecting in {:?}", delay);
            self.events.emit(ClientEvent::StreamClosed {
                reconnect_in_ms: duration_ms(delay),
                error,
            });

            tokio::time::sleep(delay).await;

            if !self.is_current(generation) {
                debug!("Reconnect cancelled");
                return;
            }
        }
    }

    async fn connect_once(&self, generation: u64) -> Ended {
        let Some(token) = self.tokens.access_token() else {
            return Ended::NoToken;
        };
        let url = match self.config.endpoint_url(&self.config.stream_path) {
            Ok(url) => url,
            Err(e) => return Ended::Failed(e.to_string()),
        };

        let request = HttpRequest::new(Method::GET, url)
            .with_headers(browser_headers(&self.config, &self.tokens.user_agent()))
            .header(ACCEPT, "text/event-stream")
            .bearer(&token);

        if !self.set_state(generation, StreamState::Connecting) {
            return Ended::Graceful;
        }
        self.events.emit(ClientEvent::StreamConnecting);

        let opened = tokio::time::timeout(self.config.request_timeout, self.transport.open_stream(request)).await;
        let response = match opened {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Ended::Failed(e.to_string()),
            Err(_) => return Ended::Failed("connect timed out".into()),
        };

        if response.status == StatusCode::UNAUTHORIZED {
            return Ended::Unauthorized;
        }
        if !response.status.is_success() {
            return Ended::Failed(format!("HTTP {}", response.status.as_u16()));
        }

        if !self.set_state(generation, StreamState::Open) {
            return Ended::Graceful;
        }
        info!("Notification stream open");
        self.events.emit(ClientEvent::StreamOpen);

        let mut parser = SseParser::default();
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    let events = match parser.push(&bytes) {
                        Ok(events) => events,
                        Err(e) => return Ended::Failed(e.to_string()),
                    };
                    for event in events {
                        self.events.emit(ClientEvent::Notification {
                            event: event.event,
                            data: event.data,
                        });
                    }
                }
                Err(e) => return Ended::Failed(e.to_string()),
            }
        }

        Ended::Graceful
    }
}

fn duration_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
