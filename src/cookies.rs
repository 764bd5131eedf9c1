//! Cookie Module
//!
//! Logical cookies, the jar capability the transport reads from, and the
//! [`CookieBridge`] that moves cookies between the active session and the jar.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::HeaderValue;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::accounts::AccountStore;
use crate::config::REFRESH_COOKIE;
use crate::events::{ClientEvent, EventSink};

/// SameSite attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Lax,
    Strict,
    None,
    #[default]
    Unspecified,
}

impl SameSite {
    /// Parse attribute values as written by servers and browser exports
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "lax" => Self::Lax,
            "strict" => Self::Strict,
            "none" | "no_restriction" => Self::None,
            _ => Self::Unspecified,
        }
    }
}

impl<'de> Deserialize<'de> for SameSite {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(SameSite::parse).unwrap_or_default())
    }
}

/// A single cookie
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "root_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub same_site: SameSite,
    /// `None` for session cookies
    #[serde(
        default,
        rename = "expirationDate",
        with = "epoch_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

fn root_path() -> String {
    "/".to_string()
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: root_path(),
            secure: false,
            http_only: false,
            same_site: SameSite::Unspecified,
            expires_at: None,
        }
    }

    /// The long-lived refresh cookie a raw secret is installed as
    pub fn refresh_secret(secret: &str, domain: &str) -> Self {
        Self {
            secure: true,
            http_only: true,
            same_site: SameSite::Lax,
            expires_at: Some(Utc::now() + chrono::Duration::days(365)),
            ..Self::new(REFRESH_COOKIE, secret.trim(), domain)
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// SameSite=None without Secure is refused by browsers
    pub fn violates_same_site_rule(&self) -> bool {
        self.same_site == SameSite::None && !self.secure
    }

    /// Domain without the leading dot
    pub fn normalized_domain(&self) -> &str {
        self.domain.trim_start_matches('.')
    }

    /// Parse a `Set-Cookie` header received from `url`
    pub fn parse_set_cookie(header: &str, url: &Url) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie::new(name, value.trim().trim_matches('"'), url.host_str()?);
        cookie.path = default_path(url);
        let mut max_age: Option<i64> = None;

        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => cookie.domain = val.trim_start_matches('.').to_string(),
                "path" if val.starts_with('/') => cookie.path = val.to_string(),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "samesite" => cookie.same_site = SameSite::parse(val),
                "max-age" => max_age = val.parse().ok(),
                "expires" => {
                    cookie.expires_at = DateTime::parse_from_rfc2822(&val.replace('-', " "))
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc));
                }
                _ => {}
            }
        }

        // Max-Age wins over Expires
        if let Some(secs) = max_age {
            cookie.expires_at = Some(Utc::now() + chrono::Duration::seconds(secs));
        }

        Some(cookie)
    }

    fn key_matches(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

impl std::fmt::Debug for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cookie")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("domain", &self.domain)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("http_only", &self.http_only)
            .field("same_site", &self.same_site)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn default_path(url: &Url) -> String {
    match url.path().rfind('/') {
        Some(0) | None => root_path(),
        Some(idx) => url.path()[..idx].to_string(),
    }
}

/// `host` is `domain` or one of its subdomains
fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/')))
}

mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(at) => serializer.serialize_f64(at.timestamp_millis() as f64 / 1000.0),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs.and_then(|s| DateTime::from_timestamp_millis((s * 1000.0) as i64)))
    }
}

/// Addressable, mutable cookie jar the HTTP transport reads from
pub trait CookieJar: Send + Sync {
    /// Live cookies for `domain`, its subdomains and its parent domains
    fn get(&self, domain: &str) -> Vec<Cookie>;

    /// Install `cookie` as if it had been received from `url`
    fn set(&self, url: &Url, cookie: Cookie) -> Result<(), CookieError>;

    fn clear(&self);

    /// Commit pending writes to the backing store
    fn flush(&self) -> Result<(), CookieError>;

    /// Cookies that would be sent with a request to `url`
    fn cookies_for_url(&self, url: &Url) -> Vec<Cookie> {
        let Some(host) = url.host_str() else {
            return Vec::new();
        };
        let https = url.scheme() == "https";
        self.get(host)
            .into_iter()
            .filter(|c| domain_matches(host, &c.domain))
            .filter(|c| path_matches(url.path(), &c.path))
            .filter(|c| https || !c.secure)
            .collect()
    }
}

/// In-memory jar enforcing browser security rules on insert
#[derive(Default)]
pub struct MemoryCookieJar {
    cookies: Mutex<Vec<Cookie>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cookies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CookieJar for MemoryCookieJar {
    fn get(&self, domain: &str) -> Vec<Cookie> {
        let domain = domain.trim_start_matches('.');
        let now = Utc::now();
        self.cookies
            .lock()
            .iter()
            .filter(|c| !c.is_expired(now))
            .filter(|c| domain_matches(&c.domain, domain) || domain_matches(domain, &c.domain))
            .cloned()
            .collect()
    }

    fn set(&self, url: &Url, mut cookie: Cookie) -> Result<(), CookieError> {
        let host = url
            .host_str()
            .ok_or_else(|| CookieError::InvalidUrl(url.to_string()))?;

        if cookie.violates_same_site_rule() {
            return Err(CookieError::InsecureSameSiteNone(cookie.name));
        }
        if cookie.secure && url.scheme() != "https" {
            return Err(CookieError::SecureOverInsecureScheme(cookie.name));
        }

        cookie.domain = match cookie.normalized_domain() {
            "" => host.to_string(),
            d => d.to_string(),
        };
        if !domain_matches(host, &cookie.domain) {
            return Err(CookieError::DomainMismatch {
                name: cookie.name,
                domain: cookie.domain,
            });
        }

        let mut cookies = self.cookies.lock();
        cookies.retain(|c| !c.key_matches(&cookie));
        if !cookie.is_expired(Utc::now()) {
            cookies.push(cookie);
        }
        Ok(())
    }

    fn clear(&self) {
        self.cookies.lock().clear();
    }

    fn flush(&self) -> Result<(), CookieError> {
        Ok(())
    }
}

/// Lets reqwest read from and write to a [`CookieJar`]
pub struct JarCookieProvider(pub Arc<dyn CookieJar>);

impl reqwest::cookie::CookieStore for JarCookieProvider {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        for header in cookie_headers {
            let Some(mut cookie) = header.to_str().ok().and_then(|raw| Cookie::parse_set_cookie(raw, url)) else {
                continue;
            };
            // One refresh cookie per domain, whatever path the server scopes it to
            if cookie.name == REFRESH_COOKIE {
                cookie.path = root_path();
            }
            let name = cookie.name.clone();
            if let Err(e) = self.0.set(url, cookie) {
                debug!("Ignoring Set-Cookie {}: {}", name, e);
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let header = self
            .0
            .cookies_for_url(url)
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");

        if header.is_empty() {
            None
        } else {
            HeaderValue::from_str(&header).ok()
        }
    }
}

/// Moves cookies between the active session and the jar
pub struct CookieBridge {
    jar: Arc<dyn CookieJar>,
    accounts: Arc<AccountStore>,
    domain: String,
    events: Arc<dyn EventSink>,
}

impl CookieBridge {
    pub fn new(
        jar: Arc<dyn CookieJar>,
        accounts: Arc<AccountStore>,
        domain: impl Into<String>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            jar,
            accounts,
            domain: domain.into(),
            events,
        }
    }

    pub fn jar(&self) -> &Arc<dyn CookieJar> {
        &self.jar
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Install `cookies` into the jar, returning how many were applied.
    ///
    /// Cookies are handled one by one; a rejected cookie is logged and skipped.
    pub fn apply(&self, cookies: &[Cookie]) -> usize {
        let mut applied = 0;

        for cookie in cookies {
            if cookie.violates_same_site_rule() {
                warn!("Dropping cookie {}: SameSite=None requires Secure", cookie.name);
                continue;
            }

            let mut cookie = cookie.clone();
            let domain = match cookie.normalized_domain() {
                "" => self.domain.clone(),
                d => d.to_string(),
            };
            cookie.domain = domain.clone();
            if cookie.name == REFRESH_COOKIE || cookie.path.is_empty() {
                cookie.path = root_path();
            }

            let url = match cookie_url(&cookie) {
                Ok(url) => url,
                Err(e) => {
                    warn!("Skipping cookie {}: bad address for {}: {}", cookie.name, domain, e);
                    continue;
                }
            };

            let name = cookie.name.clone();
            match self.jar.set(&url, cookie) {
                Ok(()) => applied += 1,
                Err(e) => warn!("Failed to apply cookie {}: {}", name, e),
            }
        }

        if let Err(e) = self.jar.flush() {
            warn!("Cookie jar flush failed: {}", e);
        }

        info!("Applied {}/{} cookies", applied, cookies.len());
        self.events.emit(ClientEvent::CookiesApplied {
            applied,
            dropped: cookies.len() - applied,
        });
        applied
    }

    /// Read the jar for the service domain and store the result in the active
    /// account so persisted state follows server-side cookie rotation.
    pub fn capture(&self) -> Result<Vec<Cookie>, CookieError> {
        let cookies = self.jar.get(&self.domain);

        match self.accounts.update_active_cookies(cookies.clone()) {
            Ok(true) => debug!("Captured {} cookies into active account", cookies.len()),
            Ok(false) => debug!("No active account, captured cookies not persisted"),
            Err(e) => return Err(CookieError::Persist(e.to_string())),
        }

        self.events.emit(ClientEvent::CookiesCaptured {
            count: cookies.len(),
        });
        Ok(cookies)
    }

    /// A refresh secret in the jar that differs from `current`, if the server
    /// rotated it. Every path the cookie may be scoped to is considered.
    pub fn rotated_secret(&self, current: &str) -> Option<String> {
        self.jar
            .get(&self.domain)
            .into_iter()
            .filter(|c| c.name == REFRESH_COOKIE && !c.value.is_empty())
            .find(|c| c.value != current)
            .map(|c| c.value)
    }

    /// Make `secret` the only refresh cookie for the service domain
    pub fn replace_refresh_secret(&self, secret: &str) {
        self.apply(&[Cookie::refresh_secret(secret, &self.domain)]);

        let now = Utc::now();
        for mut stale in self
            .jar
            .get(&self.domain)
            .into_iter()
            .filter(|c| c.name == REFRESH_COOKIE && c.path != "/")
        {
            stale.expires_at = Some(now - chrono::Duration::seconds(1));
            let result = cookie_url(&stale)
                .map_err(|e| CookieError::InvalidUrl(e.to_string()))
                .and_then(|url| self.jar.set(&url, stale));
            if let Err(e) = result {
                warn!("Failed to drop stale refresh cookie: {}", e);
            }
        }
    }
}

/// Address a cookie would have been received from
fn cookie_url(cookie: &Cookie) -> Result<Url, url::ParseError> {
    let scheme = if cookie.secure { "https" } else { "http" };
    Url::parse(&format!("{}://{}{}", scheme, cookie.normalized_domain(), cookie.path))
}

/// Cookie errors. Messages carry cookie names, never values.
#[derive(Debug, thiserror::Error)]
pub enum CookieError {
    #[error("Cookie {0} has SameSite=None without Secure")]
    InsecureSameSiteNone(String),

    #[error("Secure cookie {0} cannot be set over plain http")]
    SecureOverInsecureScheme(String),

    #[error("Cookie {name} domain {domain} does not match request host")]
    DomainMismatch { name: String, domain: String },

    #[error("Invalid cookie URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to persist cookies: {0}")]
    Persist(String),
}
