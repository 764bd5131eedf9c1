//! etc desktop client core
//!
//! Authenticated session handling for the desktop client: persisted refresh
//! secret, cookie bridging, single-flight token refresh, the API request
//! pipeline, the notifications stream and multi-account switching.

pub mod accounts;
pub mod api;
pub mod auth;
pub mod commands;
pub mod config;
pub mod cookies;
pub mod events;
pub mod logging;
pub mod storage;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use accounts::{AccountStore, AccountSwitcher};
use api::RequestPipeline;
use auth::TokenManager;
use config::ClientConfig;
use cookies::{CookieBridge, CookieJar, MemoryCookieJar};
use events::EventSink;
use storage::{SecureStorage, SessionStore};
use stream::StreamManager;
use transport::{HttpTransport, ReqwestTransport, TransportError};

/// Client state shared across commands
pub struct SessionClient {
    pub config: Arc<ClientConfig>,
    pub jar: Arc<dyn CookieJar>,
    pub store: Arc<SessionStore>,
    pub accounts: Arc<AccountStore>,
    pub bridge: Arc<CookieBridge>,
    pub tokens: Arc<TokenManager>,
    pub stream: Arc<StreamManager>,
    pub switcher: Arc<AccountSwitcher>,
    pub api: RequestPipeline,
}

impl SessionClient {
    /// Production wiring: reqwest over an in-memory jar, platform-encrypted storage
    pub fn new(config: ClientConfig, events: Arc<dyn EventSink>) -> Result<Self, TransportError> {
        let jar: Arc<dyn CookieJar> = Arc::new(MemoryCookieJar::new());
        let transport = Arc::new(ReqwestTransport::new(&config, jar.clone())?);
        let storage = Arc::new(SecureStorage::new(config.data_dir.clone()));

        Ok(Self::assemble(config, transport, jar, storage, events))
    }

    pub fn assemble(
        config: ClientConfig,
        transport: Arc<dyn HttpTransport>,
        jar: Arc<dyn CookieJar>,
        storage: Arc<SecureStorage>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(SessionStore::new(storage.clone()));
        let accounts = Arc::new(AccountStore::new(storage));
        let bridge = Arc::new(CookieBridge::new(
            jar.clone(),
            accounts.clone(),
            config.cookie_domain(),
            events.clone(),
        ));
        let tokens = Arc::new(TokenManager::new(
            config.clone(),
            transport.clone(),
            store.clone(),
            accounts.clone(),
            bridge.clone(),
            events.clone(),
        ));
        let stream = Arc::new(StreamManager::new(
            config.clone(),
            transport.clone(),
            tokens.clone(),
            events.clone(),
        ));
        let switcher = Arc::new(AccountSwitcher::new(
            accounts.clone(),
            tokens.clone(),
            stream.clone(),
            store.clone(),
            bridge.clone(),
            events,
        ));
        let api = RequestPipeline::new(config.clone(), transport, tokens.clone(), switcher.clone());

        Self {
            config,
            jar,
            store,
            accounts,
            bridge,
            tokens,
            stream,
            switcher,
            api,
        }
    }
}
