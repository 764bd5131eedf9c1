//! Configuration Module
//!
//! Service endpoints, browser identity and timing knobs for the client core.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

const DEFAULT_SITE_URL: &str = "https://xn--d1ah4a.com";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Path of the token refresh endpoint, relative to the API base.
pub const REFRESH_PATH: &str = "/v1/auth/refresh";

/// Name of the cookie carrying the long-lived refresh secret.
pub const REFRESH_COOKIE: &str = "refresh_token";

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawConfig")]
pub struct ClientConfig {
    /// Site origin, used for `Origin`/`Referer` and as the cookie domain
    pub site_url: Url,
    /// Base URL every API endpoint is appended to
    pub api_base: Url,
    /// Default user agent when the session carries none
    pub user_agent: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Notifications stream path, relative to the API base
    pub stream_path: String,
    /// Delay before reconnecting after the peer closed the stream
    pub reconnect_delay: Duration,
    /// Delay before reconnecting after a transport error
    pub error_reconnect_delay: Duration,
    pub data_dir: PathBuf,
}

/// Unvalidated configuration as read from a file or the environment
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawConfig {
    site_url: String,
    /// Derived from `site_url` when absent
    api_base: Option<String>,
    user_agent: String,
    #[serde(with = "duration_secs")]
    request_timeout: Duration,
    #[serde(with = "duration_secs")]
    connect_timeout: Duration,
    stream_path: String,
    #[serde(with = "duration_secs")]
    reconnect_delay: Duration,
    #[serde(with = "duration_secs")]
    error_reconnect_delay: Duration,
    data_dir: PathBuf,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            site_url: DEFAULT_SITE_URL.to_string(),
            api_base: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            stream_path: "/v1/notifications/stream".to_string(),
            reconnect_delay: Duration::from_secs(2),
            error_reconnect_delay: Duration::from_secs(10),
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("etc.app"),
        }
    }
}

impl TryFrom<RawConfig> for ClientConfig {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        let site_url = parse_url(&raw.site_url)?;
        let api_base = match raw.api_base {
            Some(api) => parse_url(&api)?,
            None => parse_url(&format!("{}/api", site_url.as_str().trim_end_matches('/')))?,
        };

        Ok(Self {
            site_url,
            api_base,
            user_agent: raw.user_agent,
            request_timeout: raw.request_timeout,
            connect_timeout: raw.connect_timeout,
            stream_path: raw.stream_path,
            reconnect_delay: raw.reconnect_delay,
            error_reconnect_delay: raw.error_reconnect_delay,
            data_dir: raw.data_dir,
        })
    }
}

impl ClientConfig {
    /// Build a configuration for a given site origin, deriving the API base.
    pub fn for_site(site_url: &str) -> Result<Self, ConfigError> {
        RawConfig {
            site_url: site_url.to_string(),
            ..RawConfig::default()
        }
        .try_into()
    }

    /// Load configuration, overlaying `ETC_*` environment variables on the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut raw = RawConfig::default();

        if let Ok(site) = std::env::var("ETC_SITE_URL") {
            raw.site_url = site;
        }
        if let Ok(api) = std::env::var("ETC_API_URL") {
            raw.api_base = Some(api);
        }
        if let Ok(ua) = std::env::var("ETC_USER_AGENT") {
            raw.user_agent = ua;
        }
        if let Ok(dir) = std::env::var("ETC_DATA_DIR") {
            raw.data_dir = PathBuf::from(dir);
        }

        raw.try_into()
    }

    /// Host the service cookies live under (no leading dot).
    pub fn cookie_domain(&self) -> &str {
        self.site_url.host_str().unwrap_or_default()
    }

    /// Site origin without a trailing slash, as sent in the `Origin` header
    pub fn origin(&self) -> String {
        self.site_url.as_str().trim_end_matches('/').to_string()
    }

    /// Resolve an endpoint against the API base. Absolute URLs pass through.
    pub fn endpoint_url(&self, endpoint: &str) -> Result<Url, ConfigError> {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return parse_url(endpoint);
        }
        let base = self.api_base.as_str().trim_end_matches('/');
        let path = endpoint.trim_start_matches('/');
        parse_url(&format!("{}/{}", base, path))
    }
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", raw, e)))
}

mod duration_secs {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs.max(0.0)).map_err(D::Error::custom)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}
