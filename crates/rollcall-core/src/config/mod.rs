//! Sync engine and remote endpoint configuration.
//!
//! `SyncConfig` holds the retry budget, backoff ladder, auto-sync cadence and
//! tenant visibility policy. `RemoteConfig` describes the system-of-record
//! endpoint. Both can be built in code with the `with_*` helpers or parsed from
//! a JSON document shipped alongside the client.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::TenantVisibility;
use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAYS_MS: [u64; 3] = [1_000, 5_000, 10_000];
const DEFAULT_AUTO_SYNC_SECS: u64 = 5 * 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Behaviour of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyncConfig {
    /// Failed attempts after which a change-record is moved to `failed`
    pub max_retries: u32,
    /// Backoff ladder indexed by attempt; the last value repeats
    #[serde(with = "duration_ms_list")]
    pub retry_delays: Vec<Duration>,
    /// Periodic sync cadence (`None` disables the timer)
    #[serde(with = "optional_duration_secs")]
    pub auto_sync_interval: Option<Duration>,
    /// Connectivity assumed before the first report
    pub start_online: bool,
    /// Whether untagged legacy records are visible to every tenant
    pub tenant_visibility: TenantVisibility,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delays: DEFAULT_RETRY_DELAYS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            auto_sync_interval: Some(Duration::from_secs(DEFAULT_AUTO_SYNC_SECS)),
            start_online: false,
            tenant_visibility: TenantVisibility::Lenient,
        }
    }
}

impl SyncConfig {
    /// Set the retry budget
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Replace the backoff ladder
    #[must_use]
    pub fn with_retry_delays(mut self, delays: impl IntoIterator<Item = Duration>) -> Self {
        self.retry_delays = delays.into_iter().collect();
        self
    }

    /// Set the automatic sync interval
    #[must_use]
    pub const fn with_auto_sync_interval(mut self, interval: Duration) -> Self {
        self.auto_sync_interval = Some(interval);
        self
    }

    /// Disable automatic sync (connectivity and retry triggers only)
    #[must_use]
    pub const fn without_auto_sync(mut self) -> Self {
        self.auto_sync_interval = None;
        self
    }

    #[must_use]
    pub const fn with_start_online(mut self, online: bool) -> Self {
        self.start_online = online;
        self
    }

    #[must_use]
    pub const fn with_tenant_visibility(mut self, visibility: TenantVisibility) -> Self {
        self.tenant_visibility = visibility;
        self
    }

    /// Check the values the engine relies on
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::InvalidInput(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.retry_delays.is_empty() {
            return Err(Error::InvalidInput(
                "retry_delays must contain at least one delay".to_string(),
            ));
        }
        if self.auto_sync_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::InvalidInput(
                "auto_sync_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse and validate a sync configuration document.
///
/// Missing fields fall back to defaults; unknown fields are rejected.
pub fn parse_sync_config(payload: &str) -> Result<SyncConfig> {
    let config: SyncConfig = serde_json::from_str(payload)?;
    config.validate()?;
    Ok(config)
}

/// Remote system-of-record endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// API root, e.g. `https://school.example.com/api/v1` (no trailing slash)
    pub base_url: String,
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
    /// Client-side timeout; a timed-out request counts as a failed attempt
    pub request_timeout: Duration,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl RemoteConfig {
    /// Create a configuration for the given API root
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url.into())?,
            auth_token: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        })
    }

    /// Attach a bearer token; blank tokens are ignored
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = normalize_text_option(Some(token.into()));
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Build a remote configuration from optional raw values.
///
/// Returns `None` when no usable base URL is given (local-only mode).
pub fn parse_remote_config(
    base_url: Option<String>,
    auth_token: Option<String>,
) -> Option<RemoteConfig> {
    let base_url = normalize_text_option(base_url)?;
    let config = match RemoteConfig::new(base_url) {
        Ok(config) => config,
        Err(error) => {
            tracing::warn!("Ignoring remote configuration: {error}");
            return None;
        }
    };
    Some(match auth_token {
        Some(token) => config.with_auth_token(token),
        None => config,
    })
}

fn normalize_base_url(raw: String) -> Result<String> {
    let url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::InvalidInput("remote base URL must not be empty".to_string()))?;
    if is_http_url(&url) {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "remote base URL must include http:// or https://".to_string(),
        ))
    }
}

mod duration_ms_list {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(delays: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            delays
                .iter()
                .map(|delay| u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
        let millis = Vec::<u64>::deserialize(deserializer)?;
        Ok(millis.into_iter().map(Duration::from_millis).collect())
    }
}

mod optional_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)] // serde `with` passes `&Option<T>`
    pub fn serialize<S: Serializer>(
        interval: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match interval {
            Some(interval) => serializer.serialize_some(&interval.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
