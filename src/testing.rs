//! Test doubles shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use reqwest::StatusCode;

use crate::accounts::AccountStore;
use crate::auth::TokenManager;
use crate::config::ClientConfig;
use crate::cookies::{CookieBridge, CookieJar, MemoryCookieJar};
use crate::events::{ClientEvent, EventSink};
use crate::storage::{AtRestCipher, SecureStorage, SessionStore, StorageError};
use crate::stream::StreamManager;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, StreamResponse, TransportError};

/// Scripted outcome for one request
pub enum Reply {
    Response(HttpResponse),
    Error(TransportError),
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self::Response(HttpResponse::new(code(status), Vec::new()))
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self::Response(HttpResponse::new(code(status), body.to_string()))
    }
}

fn code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).expect("valid status")
}

/// How a scripted notifications stream behaves once opened
#[derive(Clone)]
pub enum StreamScript {
    /// Emit frames, then the peer closes cleanly
    Close(Vec<&'static str>),
    /// Emit frames, then the connection breaks
    Break(Vec<&'static str>),
    /// Respond with a status and no body
    Status(u16),
    /// Fail before any response
    Refuse,
    /// Emit frames and stay open
    Hold(Vec<&'static str>),
}

type Handler = Box<dyn Fn(&HttpRequest) -> Reply + Send + Sync>;

/// In-memory [`HttpTransport`] answering from a closure
pub struct ScriptedTransport {
    handler: Handler,
    requests: Mutex<Vec<HttpRequest>>,
    delays: Mutex<HashMap<String, Duration>>,
    hang: AtomicBool,
    streams: Mutex<VecDeque<StreamScript>>,
    stream_requests: Mutex<Vec<HttpRequest>>,
    open_streams: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(handler: impl Fn(&HttpRequest) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            delays: Mutex::new(HashMap::new()),
            hang: AtomicBool::new(false),
            streams: Mutex::new(VecDeque::new()),
            stream_requests: Mutex::new(Vec::new()),
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every subsequent `send` never completes
    pub fn hang_forever(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    /// Delay replies to paths ending in `suffix`
    pub fn delay(&self, suffix: &str, delay: Duration) {
        self.delays.lock().insert(suffix.to_string(), delay);
    }

    /// Number of `send` calls to paths ending in `suffix`
    pub fn calls(&self, suffix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.path().ends_with(suffix))
            .count()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn push_stream(&self, script: StreamScript) {
        self.streams.lock().push_back(script);
    }

    /// Number of `open_stream` calls so far
    pub fn stream_attempts(&self) -> usize {
        self.stream_requests.lock().len()
    }

    pub fn stream_requests(&self) -> Vec<HttpRequest> {
        self.stream_requests.lock().clone()
    }

    /// Streams whose body has not been dropped yet
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request.clone());

        if self.hang.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }

        let delay = self
            .delays
            .lock()
            .iter()
            .find(|(suffix, _)| request.url.path().ends_with(suffix.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match (self.handler)(&request) {
            Reply::Response(response) => Ok(response),
            Reply::Error(e) => Err(e),
        }
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<StreamResponse, TransportError> {
        self.stream_requests.lock().push(request);
        let script = self
            .streams
            .lock()
            .pop_front()
            .unwrap_or(StreamScript::Hold(Vec::new()));

        let frames = |items: Vec<&'static str>| {
            stream::iter(items.into_iter().map(|f| Ok::<_, TransportError>(f.as_bytes().to_vec())))
        };

        let body = match script {
            StreamScript::Refuse => return Err(TransportError::Connect("refused".into())),
            StreamScript::Status(status) => {
                return Ok(StreamResponse {
                    status: code(status),
                    body: stream::empty().boxed(),
                })
            }
            StreamScript::Close(items) => frames(items).boxed(),
            StreamScript::Break(items) => frames(items)
                .chain(stream::once(async { Err(TransportError::Other("reset".into())) }))
                .boxed(),
            StreamScript::Hold(items) => frames(items).chain(stream::pending()).boxed(),
        };

        let guard = OpenGuard::new(self.open_streams.clone());
        Ok(StreamResponse {
            status: StatusCode::OK,
            body: body
                .map(move |item| {
                    let _alive = &guard;
                    item
                })
                .boxed(),
        })
    }
}

/// Tracks how many stream bodies are alive
struct OpenGuard(Arc<AtomicUsize>);

impl OpenGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Collects emitted events
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ClientEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&ClientEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ClientEvent) {
        self.events.lock().push(event);
    }
}

/// Cipher that is never available, forcing the fallback encoding
pub struct NoCipher;

impl AtRestCipher for NoCipher {
    fn is_available(&self) -> bool {
        false
    }

    fn encrypt(&self, _data: &[u8]) -> Result<Vec<u8>, StorageError> {
        Err(StorageError::Encryption("unavailable".into()))
    }

    fn decrypt(&self, _data: &[u8]) -> Result<Vec<u8>, StorageError> {
        Err(StorageError::Decryption("unavailable".into()))
    }
}

/// Everything below the token manager, wired against fakes
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub config: Arc<ClientConfig>,
    pub transport: Arc<ScriptedTransport>,
    pub jar: Arc<MemoryCookieJar>,
    pub store: Arc<SessionStore>,
    pub accounts: Arc<AccountStore>,
    pub bridge: Arc<CookieBridge>,
    pub events: Arc<RecordingSink>,
}

impl Fixture {
    pub fn new(handler: impl Fn(&HttpRequest) -> Reply + Send + Sync + 'static) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = ClientConfig::for_site("https://example.test").expect("config");
        config.data_dir = dir.path().to_path_buf();
        let config = Arc::new(config);

        let storage = Arc::new(SecureStorage::with_cipher(dir.path(), Box::new(NoCipher)));
        let jar = Arc::new(MemoryCookieJar::new());
        let events = Arc::new(RecordingSink::default());
        let accounts = Arc::new(AccountStore::new(storage.clone()));
        let bridge = Arc::new(CookieBridge::new(
            jar.clone() as Arc<dyn CookieJar>,
            accounts.clone(),
            config.cookie_domain(),
            events.clone(),
        ));

        Self {
            config,
            transport: Arc::new(ScriptedTransport::new(handler)),
            jar,
            store: Arc::new(SessionStore::new(storage)),
            accounts,
            bridge,
            events,
            dir,
        }
    }

    pub fn tokens(&self) -> Arc<TokenManager> {
        Arc::new(TokenManager::new(
            self.config.clone(),
            self.transport.clone(),
            self.store.clone(),
            self.accounts.clone(),
            self.bridge.clone(),
            self.events.clone(),
        ))
    }

    /// Token manager holding an access token minted from secret `"secret"`.
    /// The handler must grant the first refresh.
    pub async fn signed_in(&self) -> Arc<TokenManager> {
        self.store.save("secret").expect("save secret");
        let tokens = self.tokens();
        tokens.refresh().await.expect("initial refresh");
        tokens
    }

    pub fn stream(&self, tokens: &Arc<TokenManager>) -> Arc<StreamManager> {
        Arc::new(StreamManager::new(
            self.config.clone(),
            self.transport.clone(),
            tokens.clone(),
            self.events.clone(),
        ))
    }
}

/// Bearer token carried by a request, if any
pub fn bearer(request: &HttpRequest) -> Option<String> {
    request
        .headers
        .get(reqwest::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}
