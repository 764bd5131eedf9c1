//! Authentication Module
//!
//! Owns the short-lived access token and coordinates refreshing it.
//!
//! Concurrent callers of [`TokenManager::refresh`] share one in-flight refresh:
//! the first caller installs a shared future in the pending slot and every
//! caller arriving before it resolves awaits that same future. The slot is
//! cleared by the flight itself when it finishes, so the next demand starts a
//! new generation.
//!
//! Invalidation (logout, account switch) bumps an epoch under the state lock.
//! A refresh that completes after its epoch was bumped discards its result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use reqwest::header::SET_COOKIE;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::accounts::AccountStore;
use crate::config::{ClientConfig, REFRESH_COOKIE, REFRESH_PATH};
use crate::cookies::{Cookie, CookieBridge};
use crate::events::{ClientEvent, EventSink};
use crate::storage::SessionStore;
use crate::transport::{browser_headers, send_with_timeout, HttpRequest, HttpResponse, HttpTransport};

/// Persisted part of a login: what the service needs to recognise us.
///
/// The access token is never part of it; the refresh secret travels as the
/// `refresh_token` cookie and is persisted separately by [`SessionStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Session {
    pub fn new(cookies: Vec<Cookie>, user_agent: Option<String>) -> Self {
        Self { cookies, user_agent }
    }

    /// Value of the refresh cookie, if the session carries one
    pub fn refresh_secret(&self) -> Option<&str> {
        self.cookies
            .iter()
            .find(|c| c.name == REFRESH_COOKIE && !c.value.is_empty())
            .map(|c| c.value.as_str())
    }
}

/// Why a refresh did not produce an access token
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshFailure {
    #[error("No stored session")]
    NoData,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited by the server")]
    RateLimited,

    #[error("Blocked by an anti-automation challenge")]
    BotChallenge,

    #[error("Refresh secret rejected (HTTP {0})")]
    Rejected(u16),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Session changed while refreshing")]
    Superseded,
}

impl RefreshFailure {
    /// Stable reason string reported to callers
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoData => "no_data",
            Self::Network(_) => "network_error",
            Self::RateLimited => "rate_limited",
            Self::BotChallenge => "bot_challenge",
            Self::Rejected(_) => "token_invalid",
            Self::Server(_) => "server_error",
            Self::Superseded => "superseded",
        }
    }

    /// Only an explicit rejection of the secret ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

pub type RefreshResult = Result<(), RefreshFailure>;

type Flight = Shared<BoxFuture<'static, RefreshResult>>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

struct Grant {
    access_token: String,
    refresh_token: Option<String>,
}

#[derive(Default)]
struct AuthState {
    access_token: Option<String>,
    restored: bool,
    user_agent: Option<String>,
}

/// Access token owner and single-flight refresh coordinator
pub struct TokenManager {
    config: Arc<ClientConfig>,
    transport: Arc<dyn HttpTransport>,
    store: Arc<SessionStore>,
    accounts: Arc<AccountStore>,
    bridge: Arc<CookieBridge>,
    events: Arc<dyn EventSink>,
    state: RwLock<AuthState>,
    epoch: AtomicU64,
    pending: Mutex<Option<(u64, Flight)>>,
    next_flight: AtomicU64,
}

impl TokenManager {
    pub fn new(
        config: Arc<ClientConfig>,
        transport: Arc<dyn HttpTransport>,
        store: Arc<SessionStore>,
        accounts: Arc<AccountStore>,
        bridge: Arc<CookieBridge>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            accounts,
            bridge,
            events,
            state: RwLock::new(AuthState::default()),
            epoch: AtomicU64::new(0),
            pending: Mutex::new(None),
            next_flight: AtomicU64::new(0),
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.read().access_token.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().access_token.is_some()
    }

    pub fn is_restored(&self) -> bool {
        self.state.read().restored
    }

    /// User agent of the active session, or the configured default
    pub fn user_agent(&self) -> String {
        self.state
            .read()
            .user_agent
            .clone()
            .unwrap_or_else(|| self.config.user_agent.clone())
    }

    /// Drop the in-memory access token, keeping the session restorable
    pub fn clear_access_token(&self) {
        if self.state.write().access_token.take().is_some() {
            debug!("Access token cleared");
        }
    }

    /// Forget everything about the current identity.
    ///
    /// Any refresh still in flight is detached and its result discarded.
    pub fn invalidate(&self) {
        {
            let mut state = self.state.write();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            *state = AuthState::default();
        }
        *self.pending.lock() = None;
        info!("Session invalidated");
    }

    /// Install a session's cookies, user agent and secret and mark it restored
    pub fn install_session(&self, session: &Session) -> usize {
        let applied = self.bridge.apply(&session.cookies);

        if let Some(secret) = session.refresh_secret() {
            // Persist failure is logged by the store; the in-memory copy is kept
            let _ = self.store.save(secret);
        }

        let mut state = self.state.write();
        state.user_agent = session.user_agent.clone();
        state.restored = true;
        applied
    }

    /// Obtain a fresh access token.
    ///
    /// Concurrent callers share one network round trip and observe the same result.
    pub async fn refresh(self: &Arc<Self>) -> RefreshResult {
        let flight = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some((_, flight)) => {
                    debug!("Joining in-flight token refresh");
                    flight.clone()
                }
                None => {
                    let id = self.next_flight.fetch_add(1, Ordering::SeqCst);
                    let this = Arc::clone(self);
                    let flight = async move {
                        let result = this.run_refresh().await;
                        let mut pending = this.pending.lock();
                        if pending.as_ref().is_some_and(|(current, _)| *current == id) {
                            *pending = None;
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    *pending = Some((id, flight.clone()));
                    flight
                }
            }
        };

        flight.await
    }

    async fn run_refresh(&self) -> RefreshResult {
        let epoch = self.epoch.load(Ordering::SeqCst);

        if !self.is_restored() {
            self.restore()?;
        }

        let Some(secret) = self.store.load() else {
            return Err(self.reject(RefreshFailure::NoData));
        };

        let url = self
            .config
            .endpoint_url(REFRESH_PATH)
            .map_err(|e| RefreshFailure::Network(e.to_string()))?;
        let request = HttpRequest::new(Method::POST, url.clone())
            .with_headers(browser_headers(&self.config, &self.user_agent()))
            .json(&serde_json::json!({ "refreshToken": secret }));

        info!("Refreshing access token");
        let outcome = match send_with_timeout(&*self.transport, request, self.config.request_timeout).await {
            Ok(response) => classify(&response, &url),
            Err(e) => Err(RefreshFailure::Network(e.to_string())),
        };

        match outcome {
            Ok(grant) => self.accept(grant, &secret, epoch),
            Err(_) if self.epoch.load(Ordering::SeqCst) != epoch => {
                debug!("Discarding refresh failure for a superseded session");
                Err(RefreshFailure::Superseded)
            }
            Err(failure) => Err(self.reject(failure)),
        }
    }

    /// Load the persisted session into this process
    fn restore(&self) -> RefreshResult {
        let Some(secret) = self.store.load() else {
            warn!("No stored session to restore");
            return Err(self.reject(RefreshFailure::NoData));
        };

        let session = self.accounts.active().and_then(|a| a.session).unwrap_or_default();
        let mut cookies = session.cookies.clone();
        if session.refresh_secret().is_none() {
            cookies.retain(|c| c.name != REFRESH_COOKIE);
            cookies.push(Cookie::refresh_secret(&secret, self.bridge.domain()));
        }

        let applied = self.bridge.apply(&cookies);
        {
            let mut state = self.state.write();
            state.user_agent = session.user_agent;
            state.restored = true;
        }

        info!("Session restored with {} cookies", applied);
        self.events.emit(ClientEvent::SessionRestored { cookies: applied });
        Ok(())
    }

    fn accept(&self, grant: Grant, secret: &str, epoch: u64) -> RefreshResult {
        {
            let mut state = self.state.write();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                debug!("Discarding access token for a superseded session");
                return Err(RefreshFailure::Superseded);
            }
            state.access_token = Some(grant.access_token);
        }

        // After a rotation the jar holds only the new secret
        let rotated = grant
            .refresh_token
            .filter(|next| !next.is_empty() && next != secret)
            .or_else(|| self.bridge.rotated_secret(secret));
        match rotated {
            Some(next) => {
                info!("Server rotated the refresh secret");
                self.bridge.replace_refresh_secret(&next);
                let _ = self.store.save(&next);
            }
            None => self.store.reset_failures(),
        }

        if let Err(e) = self.bridge.capture() {
            warn!("Token refreshed but cookie capture failed: {}", e);
        }

        info!("Access token refreshed");
        self.events.emit(ClientEvent::TokenRefreshed);
        Ok(())
    }

    fn reject(&self, failure: RefreshFailure) -> RefreshFailure {
        let failures = self.store.record_failure();

        if failure.is_terminal() {
            warn!(failures, "Refresh secret rejected, purging stored session: {}", failure);
            {
                let mut state = self.state.write();
                state.access_token = None;
                state.restored = false;
            }
            self.store.clear();
            self.events.emit(ClientEvent::SessionPurged);
        } else {
            warn!(failures, "Token refresh failed, keeping session: {}", failure);
        }

        self.events.emit(ClientEvent::RefreshFailed {
            reason: failure.reason().to_string(),
            terminal: failure.is_terminal(),
        });
        failure
    }
}

/// Rotated secret announced by the refresh response's own `Set-Cookie`
fn set_cookie_secret(response: &HttpResponse, url: &Url) -> Option<String> {
    response
        .headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|raw| Cookie::parse_set_cookie(raw, url))
        .find(|cookie| cookie.name == REFRESH_COOKIE && !cookie.value.is_empty())
        .map(|cookie| cookie.value)
}

fn classify(response: &HttpResponse, url: &Url) -> Result<Grant, RefreshFailure> {
    if response.is_bot_challenge() {
        return Err(RefreshFailure::BotChallenge);
    }

    let status = response.status;
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(RefreshFailure::RateLimited);
    }
    if status.is_server_error() {
        return Err(RefreshFailure::Server(format!("HTTP {}", status.as_u16())));
    }
    if !status.is_success() {
        return Err(RefreshFailure::Rejected(status.as_u16()));
    }

    match response.json::<RefreshResponse>() {
        Ok(RefreshResponse {
            access_token: Some(access_token),
            refresh_token,
        }) if !access_token.is_empty() => Ok(Grant {
            access_token,
            refresh_token: refresh_token
                .filter(|token| !token.is_empty())
                .or_else(|| set_cookie_secret(response, url)),
        }),
        Ok(_) => Err(RefreshFailure::Server("refresh response has no access token".into())),
        Err(e) => Err(RefreshFailure::Server(format!("malformed refresh response: {}", e))),
    }
}
