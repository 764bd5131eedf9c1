//! Client Events
//!
//! Progress events emitted on every session state transition. The core only
//! depends on [`EventSink`]; an adapter forwards events to the presentation layer.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

/// Events emitted by the client core
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Persisted session was loaded and installed for this process
    SessionRestored { cookies: usize },
    /// A new access token was obtained
    TokenRefreshed,
    /// A refresh attempt failed
    RefreshFailed { reason: String, terminal: bool },
    /// The refresh secret was purged; a full login is required
    SessionPurged,
    /// Cookies were installed into the jar
    CookiesApplied { applied: usize, dropped: usize },
    /// Jar cookies were written back into the active session
    CookiesCaptured { count: usize },
    StreamConnecting,
    StreamOpen,
    /// Stream ended; a reconnect is scheduled
    StreamClosed { reconnect_in_ms: u64, error: Option<String> },
    StreamStopped,
    /// Server push event received on the notifications stream
    Notification { event: Option<String>, data: String },
    AccountSwitched { user_id: String, warning: Option<String> },
    LoggedOut,
}

impl std::fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionRestored { cookies } => {
                write!(f, "Session restored ({} cookies)", cookies)
            }
            Self::TokenRefreshed => write!(f, "Access token refreshed"),
            Self::RefreshFailed { reason, terminal } => {
                if *terminal {
                    write!(f, "Token refresh rejected ({}), login required", reason)
                } else {
                    write!(f, "Token refresh failed ({})", reason)
                }
            }
            Self::SessionPurged => write!(f, "Stored session purged"),
            Self::CookiesApplied { applied, dropped } => {
                write!(f, "Applied {} cookies, dropped {}", applied, dropped)
            }
            Self::CookiesCaptured { count } => write!(f, "Captured {} cookies", count),
            Self::StreamConnecting => write!(f, "Connecting to notifications stream"),
            Self::StreamOpen => write!(f, "Notifications stream open"),
            Self::StreamClosed { reconnect_in_ms, error } => match error {
                Some(e) => write!(f, "Stream error ({}), reconnecting in {}ms", e, reconnect_in_ms),
                None => write!(f, "Stream closed, reconnecting in {}ms", reconnect_in_ms),
            },
            Self::StreamStopped => write!(f, "Notifications stream stopped"),
            Self::Notification { event, .. } => {
                write!(f, "Notification: {}", event.as_deref().unwrap_or("message"))
            }
            Self::AccountSwitched { user_id, warning } => match warning {
                Some(w) => write!(f, "Switched to account {} ({})", user_id, w),
                None => write!(f, "Switched to account {}", user_id),
            },
            Self::LoggedOut => write!(f, "Logged out"),
        }
    }
}

/// Destination for client events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ClientEvent);
}

/// Writes every event to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ClientEvent) {
        info!(target: "etc::events", "{}", event);
    }
}

/// Fans events out to any number of subscribers, logging them as well
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ClientEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: ClientEvent) {
        TracingSink.emit(event.clone());
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}
