//! API Request Pipeline
//!
//! Executes arbitrary calls against the service API with browser identity
//! headers, a hard timeout and a single refresh-and-retry on 401.

use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::accounts::AccountSwitcher;
use crate::auth::TokenManager;
use crate::config::{ClientConfig, REFRESH_PATH};
use crate::transport::{browser_headers, send_with_timeout, HttpRequest, HttpResponse, HttpTransport, TransportError};

/// API call failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Session expired, please log in again")]
    SessionExpired,

    #[error("Blocked by an anti-automation challenge")]
    BotChallenge,

    #[error("Too many requests")]
    RateLimited,

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Non-2xx answer carrying the service's own error body
    #[error("Request failed ({status})")]
    Rejected { status: u16, body: Value },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::Network(_) => "NETWORK_ERROR",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::BotChallenge => "BOT_CHALLENGE",
            Self::RateLimited => "RATE_LIMITED",
            Self::Server { .. } => "SERVER_ERROR",
            Self::Rejected { .. } | Self::InvalidEndpoint(_) => "REQUEST_FAILED",
            Self::InvalidResponse(_) => "INVALID_RESPONSE",
        }
    }

    /// Error shape handed to the presentation layer.
    ///
    /// A structured error body from the service is passed through untouched.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Rejected { body, .. } if body.get("error").is_some() => body.clone(),
            Self::Rejected { status, body } => json!({
                "error": { "code": self.code(), "message": self.to_string(), "status": status, "details": body }
            }),
            Self::Server { status, .. } => json!({
                "error": { "code": self.code(), "message": self.to_string(), "status": status }
            }),
            _ => json!({ "error": { "code": self.code(), "message": self.to_string() } }),
        }
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => ApiError::Timeout,
            other => ApiError::Network(other.to_string()),
        }
    }
}

/// Reachability of the service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiStatus {
    pub online: bool,
    pub status: Option<u16>,
}

fn is_logout(endpoint: &str) -> bool {
    endpoint.contains("/logout")
}

fn is_refresh(endpoint: &str) -> bool {
    endpoint.trim_end_matches('/').ends_with(REFRESH_PATH)
}

pub struct RequestPipeline {
    config: Arc<ClientConfig>,
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenManager>,
    switcher: Arc<AccountSwitcher>,
}

impl RequestPipeline {
    pub fn new(
        config: Arc<ClientConfig>,
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenManager>,
        switcher: Arc<AccountSwitcher>,
    ) -> Self {
        Self {
            config,
            transport,
            tokens,
            switcher,
        }
    }

    /// Call an API endpoint and return its JSON body.
    ///
    /// A 401 triggers one shared refresh and, when it succeeds, exactly one
    /// retry. A 401 for a token that has since been replaced retries with the
    /// current token instead of refreshing again. Logout endpoints are
    /// answered locally.
    pub async fn call(&self, endpoint: &str, method: Method, body: Option<&Value>) -> Result<Value, ApiError> {
        if is_logout(endpoint) {
            info!("Logging out locally");
            self.switcher.sign_out();
            return Ok(json!({ "success": true }));
        }

        let (mut response, sent_with) = self.send(endpoint, &method, body).await?;

        if response.status == StatusCode::UNAUTHORIZED && !is_refresh(endpoint) {
            let current = self.tokens.access_token();
            if current.is_some() && current != sent_with {
                debug!("Got 401 from {} for a replaced token, retrying", endpoint);
            } else {
                debug!("Got 401 from {}, refreshing token", endpoint);
                if let Err(failure) = self.tokens.refresh().await {
                    warn!("Refresh after 401 failed: {}", failure);
                    self.tokens.clear_access_token();
                    return Err(ApiError::SessionExpired);
                }
            }

            response = self.send(endpoint, &method, body).await?.0;
            if response.status == StatusCode::UNAUTHORIZED {
                warn!("Still unauthorized after refresh: {}", endpoint);
                self.tokens.clear_access_token();
                return Err(ApiError::SessionExpired);
            }
        }

        classify(response)
    }

    /// Returns the response and the access token the request carried
    async fn send(
        &self,
        endpoint: &str,
        method: &Method,
        body: Option<&Value>,
    ) -> Result<(HttpResponse, Option<String>), ApiError> {
        let url = self
            .config
            .endpoint_url(endpoint)
            .map_err(|e| ApiError::InvalidEndpoint(e.to_string()))?;

        let mut request =
            HttpRequest::new(method.clone(), url).with_headers(browser_headers(&self.config, &self.tokens.user_agent()));
        let token = self.tokens.access_token();
        if let Some(token) = &token {
            request = request.bearer(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = send_with_timeout(&*self.transport, request, self.config.request_timeout).await?;
        Ok((response, token))
    }

    /// Bounded GET against the site origin
    pub async fn check_status(&self) -> ApiStatus {
        let request = HttpRequest::new(Method::GET, self.config.site_url.clone())
            .with_headers(browser_headers(&self.config, &self.tokens.user_agent()));

        match send_with_timeout(&*self.transport, request, self.config.connect_timeout).await {
            Ok(response) => ApiStatus {
                online: response.status.is_success() || response.status.is_redirection(),
                status: Some(response.status.as_u16()),
            },
            Err(e) => {
                debug!("Status probe failed: {}", e);
                ApiStatus {
                    online: false,
                    status: None,
                }
            }
        }
    }
}

fn classify(response: HttpResponse) -> Result<Value, ApiError> {
    if response.is_bot_challenge() {
        warn!("Request blocked by an anti-automation challenge (HTTP {})", response.status.as_u16());
        return Err(ApiError::BotChallenge);
    }

    let status = response.status;
    if status == StatusCode::NO_CONTENT {
        return Ok(json!({ "success": true }));
    }
    if status.is_success() {
        if response.body.trim_ascii().is_empty() {
            return Ok(json!({ "success": true }));
        }
        return response
            .json::<Value>()
            .map_err(|e| ApiError::InvalidResponse(e.to_string()));
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ApiError::RateLimited);
    }

    let fallback = format!("Server Error ({})", status.as_u16());
    let body = response
        .json::<Value>()
        .unwrap_or_else(|_| json!({ "error": { "message": fallback } }));

    if status.is_server_error() {
        let message = body
            .pointer("/error/message")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .unwrap_or(fallback.as_str())
            .to_string();
        return Err(ApiError::Server {
            status: status.as_u16(),
            message,
        });
    }

    Err(ApiError::Rejected {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::cookies::CookieJar;
    use crate::testing::{bearer, Fixture, Reply};

    fn pipeline(fixture: &Fixture, tokens: &Arc<TokenManager>) -> RequestPipeline {
        let switcher = Arc::new(AccountSwitcher::new(
            fixture.accounts.clone(),
            tokens.clone(),
            fixture.stream(tokens),
            fixture.store.clone(),
            fixture.bridge.clone(),
            fixture.events.clone(),
        ));
        RequestPipeline::new(fixture.config.clone(), fixture.transport.clone(), tokens.clone(), switcher)
    }

    /// Grants `tok-N` on the N-th refresh; `/feed` only accepts `tok-2`
    fn rotating_server() -> Fixture {
        let minted = AtomicUsize::new(0);
        Fixture::new(move |request| {
            if request.url.path().ends_with(REFRESH_PATH) {
                let n = minted.fetch_add(1, Ordering::SeqCst) + 1;
                return Reply::json(200, json!({ "accessToken": format!("tok-{}", n) }));
            }
            match bearer(request).as_deref() {
                Some("tok-2") => Reply::json(200, json!({ "items": [1, 2] })),
                _ => Reply::status(401),
            }
        })
    }

    #[tokio::test]
    async fn unauthorized_call_refreshes_and_retries_once() {
        let fixture = rotating_server();
        let tokens = fixture.signed_in().await;
        let api = pipeline(&fixture, &tokens);

        let body = api.call("/feed", Method::GET, None).await.unwrap();

        assert_eq!(body, json!({ "items": [1, 2] }));
        assert_eq!(fixture.transport.calls("/feed"), 2);
        assert_eq!(fixture.transport.calls(REFRESH_PATH), 2);
    }

    #[tokio::test]
    async fn failed_refresh_yields_session_expired_without_third_call() {
        let fixture = Fixture::new(|request| {
            let body = String::from_utf8_lossy(request.body.as_deref().unwrap_or_default()).into_owned();
            if request.url.path().ends_with(REFRESH_PATH) && body.contains("\"secret\"") {
                Reply::json(200, json!({ "accessToken": "tok", "refreshToken": "gone" }))
            } else {
                Reply::status(401)
            }
        });
        let tokens = fixture.signed_in().await;
        let api = pipeline(&fixture, &tokens);

        let err = api.call("/feed", Method::GET, None).await.unwrap_err();

        assert_eq!(err, ApiError::SessionExpired);
        assert_eq!(err.code(), "SESSION_EXPIRED");
        assert_eq!(fixture.transport.calls("/feed"), 1);
        assert_eq!(tokens.access_token(), None);
    }

    #[tokio::test]
    async fn still_unauthorized_after_refresh_does_not_loop() {
        let fixture = Fixture::new(|request| {
            if request.url.path().ends_with(REFRESH_PATH) {
                Reply::json(200, json!({ "accessToken": "tok" }))
            } else {
                Reply::status(401)
            }
        });
        let tokens = fixture.signed_in().await;
        let api = pipeline(&fixture, &tokens);

        assert_eq!(api.call("/feed", Method::GET, None).await, Err(ApiError::SessionExpired));
        assert_eq!(fixture.transport.calls("/feed"), 2);
        assert_eq!(fixture.transport.calls(REFRESH_PATH), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_unauthorized_calls_share_one_refresh() {
        let fixture = rotating_server();
        fixture.transport.delay(REFRESH_PATH, Duration::from_millis(100));
        let tokens = fixture.signed_in().await;
        let api = pipeline(&fixture, &tokens);

        let results = futures::future::join_all((0..3).map(|_| api.call("/feed", Method::GET, None))).await;

        assert!(results.iter().all(|r| r == &Ok(json!({ "items": [1, 2] }))));
        assert_eq!(fixture.transport.calls("/feed"), 6);
        // one to sign in, one shared by all three calls
        assert_eq!(fixture.transport.calls(REFRESH_PATH), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn late_unauthorized_reply_reuses_the_new_token() {
        let fixture = rotating_server();
        fixture.transport.delay(REFRESH_PATH, Duration::from_millis(50));
        fixture.transport.delay("/slow", Duration::from_millis(200));
        let tokens = fixture.signed_in().await;
        let api = pipeline(&fixture, &tokens);

        // `/fast` refreshes and finishes before `/slow` gets its 401 for tok-1
        let (fast, slow) = tokio::join!(
            api.call("/fast", Method::GET, None),
            api.call("/slow", Method::GET, None)
        );

        assert_eq!(fast, Ok(json!({ "items": [1, 2] })));
        assert_eq!(slow, Ok(json!({ "items": [1, 2] })));
        assert_eq!(fixture.transport.calls(REFRESH_PATH), 2);
        assert_eq!(fixture.transport.calls("/slow"), 2);

        let retried = fixture
            .transport
            .requests()
            .into_iter()
            .filter(|r| r.url.path().ends_with("/slow"))
            .map(|r| bearer(&r))
            .collect::<Vec<_>>();
        assert_eq!(retried, vec![Some("tok-1".to_string()), Some("tok-2".to_string())]);
    }

    #[tokio::test]
    async fn refresh_endpoint_is_never_retried() {
        let fixture = Fixture::new(|_| Reply::status(401));
        let tokens = fixture.tokens();
        let api = pipeline(&fixture, &tokens);

        let err = api.call(REFRESH_PATH, Method::POST, None).await.unwrap_err();

        assert!(matches!(err, ApiError::Rejected { status: 401, .. }));
        assert_eq!(fixture.transport.calls(REFRESH_PATH), 1);
    }

    #[tokio::test]
    async fn bot_challenge_is_surfaced_and_not_retried() {
        let fixture = Fixture::new(|_| {
            let mut response = HttpResponse::new(StatusCode::FORBIDDEN, "");
            response
                .headers
                .insert("cf-mitigated", reqwest::header::HeaderValue::from_static("challenge"));
            Reply::Response(response)
        });
        let api = pipeline(&fixture, &fixture.tokens());

        let err = api.call("/feed", Method::GET, None).await.unwrap_err();

        assert_eq!(err.code(), "BOT_CHALLENGE");
        assert_eq!(fixture.transport.calls(""), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_call_times_out() {
        let fixture = Fixture::new(|_| Reply::status(200));
        fixture.transport.hang_forever();
        let api = pipeline(&fixture, &fixture.tokens());

        let err = api.call("/feed", Method::GET, None).await.unwrap_err();
        assert_eq!(err, ApiError::Timeout);
        assert_eq!(err.to_value()["error"]["code"], "TIMEOUT");
    }

    #[tokio::test]
    async fn logout_is_local() {
        let fixture = Fixture::new(|_| Reply::json(200, json!({ "accessToken": "tok" })));
        let tokens = fixture.signed_in().await;
        let api = pipeline(&fixture, &tokens);
        let before = fixture.transport.calls("");

        let body = api.call("/v1/auth/logout", Method::POST, None).await.unwrap();

        assert_eq!(body, json!({ "success": true }));
        assert_eq!(fixture.transport.calls(""), before);
        assert_eq!(tokens.access_token(), None);
        assert_eq!(fixture.store.load(), None);
        assert!(fixture.jar.get("example.test").is_empty());
    }

    #[tokio::test]
    async fn request_carries_identity_bearer_and_body() {
        let fixture = Fixture::new(|request| {
            if request.url.path().ends_with(REFRESH_PATH) {
                Reply::json(200, json!({ "accessToken": "tok" }))
            } else {
                Reply::json(201, json!({ "id": "p1" }))
            }
        });
        let tokens = fixture.signed_in().await;
        let api = pipeline(&fixture, &tokens);

        let body = api
            .call("/posts", Method::POST, Some(&json!({ "content": "hi" })))
            .await
            .unwrap();
        assert_eq!(body["id"], "p1");

        let request = fixture.transport.requests().pop().unwrap();
        assert_eq!(request.url.as_str(), "https://example.test/api/posts");
        assert_eq!(bearer(&request).as_deref(), Some("tok"));
        assert_eq!(request.headers[reqwest::header::ORIGIN], "https://example.test");
        assert_eq!(request.body.as_deref(), Some(br#"{"content":"hi"}"#.as_slice()));
    }

    #[tokio::test]
    async fn empty_and_no_content_responses_are_success() {
        let fixture = Fixture::new(|request| match request.url.path() {
            "/api/a" => Reply::status(204),
            _ => Reply::status(200),
        });
        let api = pipeline(&fixture, &fixture.tokens());

        assert_eq!(api.call("/a", Method::DELETE, None).await.unwrap(), json!({ "success": true }));
        assert_eq!(api.call("/b", Method::POST, None).await.unwrap(), json!({ "success": true }));
    }

    #[tokio::test]
    async fn error_responses_are_classified() {
        let fixture = Fixture::new(|request| match request.url.path() {
            "/api/missing" => Reply::json(404, json!({ "error": { "code": "NOT_FOUND", "message": "nope" } })),
            "/api/busy" => Reply::status(429),
            "/api/broken" => Reply::Response(HttpResponse::new(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>")),
            _ => Reply::Response(HttpResponse::new(StatusCode::OK, "not json")),
        });
        let api = pipeline(&fixture, &fixture.tokens());

        let missing = api.call("/missing", Method::GET, None).await.unwrap_err();
        assert_eq!(missing.to_value()["error"]["code"], "NOT_FOUND");

        assert_eq!(api.call("/busy", Method::GET, None).await, Err(ApiError::RateLimited));

        let broken = api.call("/broken", Method::GET, None).await.unwrap_err();
        assert_eq!(
            broken,
            ApiError::Server {
                status: 502,
                message: "Server Error (502)".into()
            }
        );

        let garbled = api.call("/garbled", Method::GET, None).await.unwrap_err();
        assert_eq!(garbled.code(), "INVALID_RESPONSE");
    }

    #[tokio::test]
    async fn status_probe_reports_reachability() {
        let fixture = Fixture::new(|_| Reply::status(200));
        let api = pipeline(&fixture, &fixture.tokens());
        assert_eq!(
            api.check_status().await,
            ApiStatus {
                online: true,
                status: Some(200)
            }
        );

        let fixture = Fixture::new(|_| Reply::Error(TransportError::Connect("refused".into())));
        let api = pipeline(&fixture, &fixture.tokens());
        assert!(!api.check_status().await.online);
    }
}
