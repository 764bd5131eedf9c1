//! Accounts
//!
//! The persisted book of signed-in accounts and the switcher that swaps the
//! active identity across every session component.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::auth::{Session, TokenManager};
use crate::cookies::{Cookie, CookieBridge};
use crate::events::{ClientEvent, EventSink};
use crate::storage::{SecureStorage, SessionStore, StorageError};
use crate::stream::StreamManager;

const ACCOUNTS_KEY: &str = "accounts";

/// Profile as returned by the service's `/profile` endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Remaining profile fields, kept verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            display_name: None,
            avatar: None,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub user: UserProfile,
    #[serde(default)]
    pub session: Option<Session>,
    pub last_updated: DateTime<Utc>,
}

impl Account {
    pub fn id(&self) -> &str {
        &self.user.id
    }
}

/// Account list entry for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountBook {
    active_id: Option<String>,
    #[serde(default)]
    accounts: BTreeMap<String, Account>,
}

impl AccountBook {
    fn active(&self) -> Option<&Account> {
        self.active_id.as_ref().and_then(|id| self.accounts.get(id))
    }
}

/// Persisted multi-account book
pub struct AccountStore {
    storage: Arc<SecureStorage>,
    book: Mutex<AccountBook>,
}

impl AccountStore {
    /// Load the book; an unreadable one starts empty and is discarded
    pub fn new(storage: Arc<SecureStorage>) -> Self {
        let book = if storage.exists(ACCOUNTS_KEY) {
            match storage.load::<AccountBook>(ACCOUNTS_KEY) {
                Ok(book) => {
                    debug!("Loaded {} stored accounts", book.accounts.len());
                    book
                }
                Err(e) => {
                    warn!("Stored account list is unreadable, starting empty: {}", e);
                    let _ = storage.delete(ACCOUNTS_KEY);
                    AccountBook::default()
                }
            }
        } else {
            AccountBook::default()
        };

        Self {
            storage,
            book: Mutex::new(book),
        }
    }

    fn persist(&self, book: &AccountBook) -> Result<(), StorageError> {
        self.storage.save(ACCOUNTS_KEY, book).map_err(|e| {
            error!("Failed to persist account list: {}", e);
            e
        })
    }

    pub fn list(&self) -> Vec<AccountSummary> {
        let book = self.book.lock();
        book.accounts
            .values()
            .map(|acc| AccountSummary {
                id: acc.user.id.clone(),
                username: acc.user.username.clone(),
                display_name: acc.user.display_name.clone(),
                avatar: acc.user.avatar.clone(),
                is_active: book.active_id.as_deref() == Some(acc.id()),
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Account> {
        self.book.lock().accounts.get(id).cloned()
    }

    pub fn active(&self) -> Option<Account> {
        self.book.lock().active().cloned()
    }

    pub fn active_id(&self) -> Option<String> {
        self.book.lock().active().map(|a| a.user.id.clone())
    }

    /// Insert or replace an account and make it active
    pub fn upsert(&self, user: UserProfile, session: Session) -> Result<(), StorageError> {
        if user.id.is_empty() {
            warn!("Ignoring account without an id");
            return Ok(());
        }

        let mut book = self.book.lock();
        info!("Saving account {}", user.username);
        book.active_id = Some(user.id.clone());
        book.accounts.insert(
            user.id.clone(),
            Account {
                user,
                session: Some(session),
                last_updated: Utc::now(),
            },
        );
        self.persist(&book)
    }

    /// Returns `false` when no account has this id
    pub fn set_active(&self, id: &str) -> Result<bool, StorageError> {
        let mut book = self.book.lock();
        if !book.accounts.contains_key(id) {
            return Ok(false);
        }
        book.active_id = Some(id.to_string());
        self.persist(&book)?;
        Ok(true)
    }

    /// Remove an account. When it was active, the first remaining account is
    /// promoted; the new active id is returned.
    pub fn remove(&self, id: &str) -> Result<Option<String>, StorageError> {
        let mut book = self.book.lock();
        if book.accounts.remove(id).is_none() {
            return Ok(book.active_id.clone());
        }

        if book.active_id.as_deref() == Some(id) {
            book.active_id = book.accounts.keys().next().cloned();
        }
        info!("Removed account {}", id);
        self.persist(&book)?;
        Ok(book.active_id.clone())
    }

    /// Leave every account stored but none active
    pub fn deactivate(&self) -> Result<(), StorageError> {
        let mut book = self.book.lock();
        if book.active_id.take().is_some() {
            self.persist(&book)?;
        }
        Ok(())
    }

    /// Remove the active account without promoting another one
    pub fn remove_active(&self) -> Result<Option<String>, StorageError> {
        let mut book = self.book.lock();
        let Some(id) = book.active_id.take() else {
            return Ok(None);
        };
        book.accounts.remove(&id);
        self.persist(&book)?;
        Ok(Some(id))
    }

    /// Replace the active account's cookies. `Ok(false)` when nothing is active.
    pub fn update_active_cookies(&self, cookies: Vec<Cookie>) -> Result<bool, StorageError> {
        let mut book = self.book.lock();
        let Some(id) = book.active_id.clone() else {
            return Ok(false);
        };
        let Some(account) = book.accounts.get_mut(&id) else {
            return Ok(false);
        };

        account.session.get_or_insert_with(Session::default).cookies = cookies;
        account.last_updated = Utc::now();
        self.persist(&book)?;
        Ok(true)
    }
}

/// Result of a completed switch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("Account not found: {0}")]
    NotFound(String),

    #[error("Account {0} has no stored session")]
    MissingSession(String),
}

/// Swaps the active identity across the session components
pub struct AccountSwitcher {
    accounts: Arc<AccountStore>,
    tokens: Arc<TokenManager>,
    stream: Arc<StreamManager>,
    store: Arc<SessionStore>,
    bridge: Arc<CookieBridge>,
    events: Arc<dyn EventSink>,
}

impl AccountSwitcher {
    pub fn new(
        accounts: Arc<AccountStore>,
        tokens: Arc<TokenManager>,
        stream: Arc<StreamManager>,
        store: Arc<SessionStore>,
        bridge: Arc<CookieBridge>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            accounts,
            tokens,
            stream,
            store,
            bridge,
            events,
        }
    }

    pub async fn switch_to(&self, user_id: &str) -> Result<SwitchOutcome, SwitchError> {
        let target = self
            .accounts
            .get(user_id)
            .ok_or_else(|| SwitchError::NotFound(user_id.to_string()))?;
        self.switch(&target).await
    }

    /// Make `target` the active identity.
    ///
    /// A target without session data fails before anything is touched. A
    /// refresh failure afterwards still leaves the target active.
    pub async fn switch(&self, target: &Account) -> Result<SwitchOutcome, SwitchError> {
        let session = match &target.session {
            Some(session) if !target.user.id.is_empty() && !session.cookies.is_empty() => session.clone(),
            _ => return Err(SwitchError::MissingSession(target.user.id.clone())),
        };

        info!("Switching to account {}", target.user.username);
        self.reset_surface();

        let activated = match self.accounts.set_active(target.id()) {
            Ok(true) => Ok(()),
            Ok(false) => self.accounts.upsert(target.user.clone(), session.clone()),
            Err(e) => Err(e),
        };
        if let Err(e) = activated {
            warn!("Active account not persisted: {}", e);
        }

        let applied = self.tokens.install_session(&session);
        debug!("Installed {} cookies for {}", applied, target.user.username);

        let warning = match self.tokens.refresh().await {
            Ok(()) => None,
            Err(failure) => {
                warn!("Switched account but token refresh failed: {}", failure);
                Some("token_refresh_failed".to_string())
            }
        };

        self.events.emit(ClientEvent::AccountSwitched {
            user_id: target.user.id.clone(),
            warning: warning.clone(),
        });
        Ok(SwitchOutcome {
            success: true,
            warning,
        })
    }

    /// Local logout: forget the active account and every trace of its session
    pub fn sign_out(&self) {
        self.reset_surface();
        match self.accounts.remove_active() {
            Ok(Some(id)) => info!("Signed out of account {}", id),
            Ok(None) => debug!("Signed out with no active account"),
            Err(e) => warn!("Signed out but account list not persisted: {}", e),
        }
        self.events.emit(ClientEvent::LoggedOut);
    }

    /// Drop the in-memory identity first, then the stored surface
    pub fn reset_surface(&self) {
        self.tokens.invalidate();
        self.stream.stop();
        self.store.clear();
        self.bridge.jar().clear();
        if let Err(e) = self.bridge.jar().flush() {
            warn!("Failed to flush cookie jar: {}", e);
        }
    }
}
