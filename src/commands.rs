//! Commands Module
//!
//! Operations exposed to the presentation layer. Every command answers with a
//! plain serializable shape (`{success, error | warning}` or raw JSON) instead
//! of a Rust error, so an IPC adapter can forward results verbatim.

use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::accounts::{AccountSummary, UserProfile};
use crate::api::{ApiError, ApiStatus};
use crate::auth::{RefreshFailure, Session};
use crate::cookies::Cookie;
use crate::SessionClient;

const PROFILE_PATH: &str = "/profile";
const LOGOUT_PATH: &str = "/v1/auth/logout";
const MIN_TOKEN_LEN: usize = 10;

// Response types for the frontend

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl CommandResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            warning: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            warning: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoginResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            user: None,
            error: Some(error.into()),
        }
    }
}

// Commands

/// Restore the stored session and return the signed-in user.
///
/// `null` when there is no usable session; `{"error":{"code":"NETWORK_ERROR"}}`
/// when the service could not be reached.
pub async fn get_init_user(client: &SessionClient) -> Value {
    debug!("Checking for an active session");

    if let Err(failure) = client.tokens.refresh().await {
        info!("No active session: {}", failure.reason());
        return match failure {
            RefreshFailure::Network(_) => json!({ "error": { "code": "NETWORK_ERROR" } }),
            _ => Value::Null,
        };
    }

    let Some((user, raw)) = fetch_profile(client).await else {
        return Value::Null;
    };

    info!("Signed in as {}", user.username);
    let session = client
        .accounts
        .active()
        .filter(|acc| acc.user.id == user.id)
        .and_then(|acc| acc.session)
        .unwrap_or_else(|| current_session(client, None));
    if let Err(e) = client.accounts.upsert(user, session) {
        warn!("Account not persisted: {}", e);
    }

    client.stream.start();
    raw
}

pub fn list_accounts(client: &SessionClient) -> Vec<AccountSummary> {
    client.accounts.list()
}

pub async fn switch_account(client: &SessionClient, user_id: &str) -> CommandResult {
    info!("Switching to account {}", user_id);
    match client.switcher.switch_to(user_id).await {
        Ok(outcome) => {
            client.stream.start();
            CommandResult {
                success: outcome.success,
                error: None,
                warning: outcome.warning,
            }
        }
        Err(e) => {
            error!("Account switch failed: {}", e);
            CommandResult::failed(e.to_string())
        }
    }
}

/// Remove an account. Removing the active one moves to the next account, or
/// wipes the session when none remain.
pub async fn remove_account(client: &SessionClient, user_id: &str) -> CommandResult {
    info!("Removing account {}", user_id);
    let was_active = client.accounts.active_id().as_deref() == Some(user_id);

    let next = match client.accounts.remove(user_id) {
        Ok(next) => next,
        Err(e) => return CommandResult::failed(e.to_string()),
    };
    if !was_active {
        return CommandResult::ok();
    }

    match next {
        Some(next) => match client.switcher.switch_to(&next).await {
            Ok(outcome) => CommandResult {
                success: true,
                error: None,
                warning: outcome.warning,
            },
            Err(e) => {
                warn!("Could not activate account {}: {}", next, e);
                client.switcher.reset_surface();
                if let Err(e) = client.accounts.deactivate() {
                    warn!("Account {} still marked active: {}", next, e);
                }
                CommandResult::ok()
            }
        },
        None => {
            client.switcher.reset_surface();
            CommandResult::ok()
        }
    }
}

/// Sign in with a raw refresh secret
pub async fn token_login(client: &SessionClient, token: &str) -> LoginResult {
    let token = token.trim();
    if token.len() < MIN_TOKEN_LEN {
        return LoginResult::failed("Invalid token");
    }

    let cookie = Cookie::refresh_secret(token, client.config.cookie_domain());
    finalize_login(client, Session::new(vec![cookie], None)).await
}

/// Sign in with cookies exported from a browser as a JSON array
pub async fn import_cookies(client: &SessionClient, json: &str) -> LoginResult {
    let parsed: Value = match serde_json::from_str(json) {
        Ok(value) => value,
        Err(e) => return LoginResult::failed(format!("Invalid JSON: {}", e)),
    };

    if parsed.get("data").is_some_and(Value::is_string) {
        return LoginResult::failed("Encrypted cookie exports are not supported");
    }
    if !parsed.is_array() {
        return LoginResult::failed("Unknown JSON format");
    }

    let cookies: Vec<Cookie> = match serde_json::from_value(parsed) {
        Ok(cookies) => cookies,
        Err(e) => return LoginResult::failed(format!("Invalid cookie list: {}", e)),
    };
    info!("Importing {} cookies", cookies.len());
    finalize_login(client, Session::new(cookies, None)).await
}

/// Install a fresh session, verify it and record the account
pub async fn finalize_login(client: &SessionClient, session: Session) -> LoginResult {
    client.switcher.reset_surface();
    // Cookie capture during verification must not land in the previous account
    if let Err(e) = client.accounts.deactivate() {
        warn!("Previous account still marked active: {}", e);
    }
    let applied = client.tokens.install_session(&session);
    debug!("Installed {} cookies for login", applied);

    if let Err(failure) = client.tokens.refresh().await {
        warn!("Login verification failed: {}", failure);
        return LoginResult::failed("Could not verify session");
    }

    let Some((user, raw)) = fetch_profile(client).await else {
        return LoginResult::failed("Could not verify session");
    };

    info!("Logged in as {}", user.username);
    let session = current_session(client, session.user_agent);
    if let Err(e) = client.accounts.upsert(user, session) {
        warn!("Account not persisted: {}", e);
    }

    client.stream.start();
    LoginResult {
        success: true,
        user: Some(raw),
        error: None,
    }
}

pub async fn logout(client: &SessionClient) -> CommandResult {
    match client.api.call(LOGOUT_PATH, Method::POST, None).await {
        Ok(_) => CommandResult::ok(),
        Err(e) => CommandResult::failed(e.to_string()),
    }
}

/// Generic API call; failures come back as `{"error": {...}}`
pub async fn api_call(client: &SessionClient, endpoint: &str, method: &str, body: Option<Value>) -> Value {
    let method = match Method::from_bytes(method.to_ascii_uppercase().as_bytes()) {
        Ok(method) => method,
        Err(_) => return ApiError::InvalidEndpoint(format!("bad method {}", method)).to_value(),
    };

    match client.api.call(endpoint, method, body.as_ref()).await {
        Ok(value) => value,
        Err(e) => {
            debug!("API call {} failed: {}", endpoint, e.code());
            e.to_value()
        }
    }
}

pub async fn check_api_status(client: &SessionClient) -> ApiStatus {
    client.api.check_status().await
}

pub fn start_presence(client: &SessionClient) -> bool {
    client.stream.start()
}

pub fn stop_presence(client: &SessionClient) {
    client.stream.stop();
}

async fn fetch_profile(client: &SessionClient) -> Option<(UserProfile, Value)> {
    let body = match client.api.call(PROFILE_PATH, Method::GET, None).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Profile request failed: {}", e);
            return None;
        }
    };

    let raw = body.get("user")?.clone();
    match serde_json::from_value::<UserProfile>(raw.clone()) {
        Ok(user) if !user.id.is_empty() => Some((user, raw)),
        Ok(_) => None,
        Err(e) => {
            warn!("Unexpected profile shape: {}", e);
            None
        }
    }
}

/// Session built from what the jar holds right now
fn current_session(client: &SessionClient, user_agent: Option<String>) -> Session {
    let cookies = client.jar.get(client.config.cookie_domain());
    Session::new(cookies, user_agent.or_else(|| Some(client.tokens.user_agent())))
}
