//! HTTP Transport
//!
//! The seam between the client core and the network. [`ReqwestTransport`] is
//! the production implementation; its cookie jar is the shared [`CookieJar`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, ORIGIN, REFERER, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::cookies::{CookieJar, JarCookieProvider};

/// Body fragments that identify an anti-automation interstitial
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-chl",
    "challenge-platform",
    "just a moment...",
    "attention required",
    "ddos-guard",
    "captcha",
];

/// Outbound request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn header(mut self, name: HeaderName, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(v) => {
                self.headers.insert(name, v);
            }
            Err(_) => warn!("Dropping header {} with invalid value", name),
        }
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header(reqwest::header::AUTHORIZATION, &format!("Bearer {}", token))
    }

    /// Attach a JSON body
    pub fn json(mut self, body: &serde_json::Value) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(body.to_string().into_bytes());
        self
    }
}

/// Fully buffered response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn content_type(&self) -> &str {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    /// Whether this is an anti-automation challenge rather than an API answer.
    ///
    /// A challenge says nothing about the session; only the transport is blocked.
    pub fn is_bot_challenge(&self) -> bool {
        if self
            .headers
            .get("cf-mitigated")
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"challenge"))
        {
            return true;
        }

        let status = self.status.as_u16();
        if !matches!(status, 403 | 429 | 503) || !self.content_type().contains("text/html") {
            return false;
        }

        let head = &self.body[..self.body.len().min(16 * 1024)];
        let head = String::from_utf8_lossy(head).to_ascii_lowercase();
        CHALLENGE_MARKERS.iter().any(|m| head.contains(m))
    }
}

/// Long-lived response whose body arrives as chunks
pub struct StreamResponse {
    pub status: StatusCode,
    pub body: BoxStream<'static, Result<Vec<u8>, TransportError>>,
}

/// Network seam for every outbound call
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send a request and buffer the whole response
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Send a request and hand back the body as a stream
    async fn open_stream(&self, request: HttpRequest) -> Result<StreamResponse, TransportError>;
}

/// Send with a hard wall-clock bound. On expiry the in-flight call is dropped,
/// which aborts the underlying connection.
pub async fn send_with_timeout(
    transport: &dyn HttpTransport,
    request: HttpRequest,
    timeout: Duration,
) -> Result<HttpResponse, TransportError> {
    let url = request.url.clone();
    match tokio::time::timeout(timeout, transport.send(request)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Request to {} timed out after {:?}", url.path(), timeout);
            Err(TransportError::Timeout)
        }
    }
}

/// Header set a desktop Chrome sends for same-origin XHR
pub fn browser_headers(config: &ClientConfig, user_agent: &str) -> HeaderMap {
    let origin = config.origin();
    let referer = format!("{}/", origin);
    let pairs: [(HeaderName, &str); 10] = [
        (USER_AGENT, user_agent),
        (ORIGIN, origin.as_str()),
        (REFERER, referer.as_str()),
        (ACCEPT, "application/json"),
        (HeaderName::from_static("sec-ch-ua"), "\"Chromium\";v=\"124\", \"Google Chrome\";v=\"124\", \"Not-A.Brand\";v=\"99\""),
        (HeaderName::from_static("sec-ch-ua-mobile"), "?0"),
        (HeaderName::from_static("sec-ch-ua-platform"), "\"Windows\""),
        (HeaderName::from_static("sec-fetch-site"), "same-origin"),
        (HeaderName::from_static("sec-fetch-mode"), "cors"),
        (HeaderName::from_static("sec-fetch-dest"), "empty"),
    ];

    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        match HeaderValue::from_str(value) {
            Ok(v) => {
                headers.insert(name, v);
            }
            Err(_) => warn!("Skipping identity header {} with invalid value", name),
        }
    }
    headers
}

/// reqwest-backed transport sharing the client's cookie jar
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig, jar: Arc<dyn CookieJar>) -> Result<Self, TransportError> {
        // No overall timeout here: the notifications stream stays open indefinitely.
        // Plain calls are bounded by `send_with_timeout`.
        let client = reqwest::Client::builder()
            .cookie_provider(Arc::new(JarCookieProvider(jar)))
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| TransportError::Build(e.to_string()))?;

        Ok(Self { client })
    }

    fn build(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        builder
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        debug!("{} {}", request.method, request.url.path());

        let response = self.build(request).send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse { status, headers, body })
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<StreamResponse, TransportError> {
        debug!("Opening stream {}", request.url.path());

        let response = self.build(request).send().await?;
        let status = response.status();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(TransportError::from))
            .boxed();

        Ok(StreamResponse { status, body })
    }
}

/// Transport errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Transport error: {0}")]
    Other(String),

    #[error("Failed to build HTTP client: {0}")]
    Build(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}
