//! Client configuration.
//!
//! [`ClientConfig`] carries everything the realtime client needs to reach the
//! server: the platform base URL, the tenant credentials used for the
//! handshake extension, and tuning knobs for timeouts, reconnection and
//! queue sizes.
//!
//! Configuration can be built in code or read from the environment:
//!
//! | Variable                   | Field                          |
//! |----------------------------|--------------------------------|
//! | `C8Y_BASE_URL`             | `base_url` (required)          |
//! | `C8Y_TENANT`               | `credentials.tenant` (required)|
//! | `C8Y_USER`                 | `credentials.username` (required) |
//! | `C8Y_PASSWORD`             | `credentials.password` (required) |
//! | `C8Y_HANDSHAKE_TIMEOUT_MS` | `handshake_timeout`            |
//! | `C8Y_RECONNECT_ATTEMPTS`   | `reconnect.max_attempts`       |

use std::fmt;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use url::Url;

use crate::error::{RealtimeError, Result};

/// Fixed path of the realtime endpoint.
pub const REALTIME_PATH: &str = "/cep/realtime";

/// Default time to wait for the `/meta/handshake` reply.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default writer queue capacity.
pub const DEFAULT_WRITER_CAPACITY: usize = 256;

/// Default capacity of the client event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Tenant credentials sent in the handshake authentication extension.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub tenant: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(
        tenant: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Base64 of `tenant/username:password`.
    pub fn token(&self) -> String {
        let raw = format!("{}/{}:{}", self.tenant, self.username, self.password);
        general_purpose::STANDARD.encode(raw.as_bytes())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("tenant", &self.tenant)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Automatic reconnection after the socket is lost.
///
/// Backoff starts at `initial_backoff` and doubles per attempt up to
/// `max_backoff`. `max_attempts == 0` disables reconnection; the session then
/// ends on the first transport failure and the caller must `connect()` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Delay before the given attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Realtime client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Platform base URL, e.g. `https://tenant.example.com`.
    pub base_url: String,
    pub credentials: Credentials,
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub writer_capacity: usize,
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            base_url: base_url.into(),
            credentials,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            writer_capacity: DEFAULT_WRITER_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Read configuration from `C8Y_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| RealtimeError::Config(format!("{} is not set", key)))
        };

        let credentials = Credentials::new(
            required("C8Y_TENANT")?,
            required("C8Y_USER")?,
            required("C8Y_PASSWORD")?,
        );
        let mut config = Self::new(required("C8Y_BASE_URL")?, credentials);

        if let Some(ms) = lookup("C8Y_HANDSHAKE_TIMEOUT_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                RealtimeError::Config(format!("C8Y_HANDSHAKE_TIMEOUT_MS is not a number: {}", ms))
            })?;
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = lookup("C8Y_RECONNECT_ATTEMPTS") {
            config.reconnect.max_attempts = attempts.parse().map_err(|_| {
                RealtimeError::Config(format!(
                    "C8Y_RECONNECT_ATTEMPTS is not a number: {}",
                    attempts
                ))
            })?;
        }

        Ok(config)
    }

    /// Websocket URL of the realtime endpoint derived from `base_url`.
    pub fn endpoint(&self) -> Result<Url> {
        realtime_endpoint(&self.base_url)
    }
}

/// Map a platform base URL to its realtime websocket endpoint.
///
/// `http` becomes `ws`, `https` becomes `wss`; the path is always
/// [`REALTIME_PATH`].
pub fn realtime_endpoint(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RealtimeError::Config(format!(
                "unsupported URL scheme: {}",
                other
            )))
        }
    };
    if url.host_str().is_none() {
        return Err(RealtimeError::Config(format!("URL has no host: {}", base_url)));
    }
    url.set_scheme(scheme)
        .map_err(|_| {
            RealtimeError::Config(format!("cannot use scheme {} for {}", scheme, base_url))
        })?;
    url.set_path(REALTIME_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
