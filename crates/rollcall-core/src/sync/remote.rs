//! Remote system-of-record client.
//!
//! [`RemoteApi`] is the seam the sync engine talks through; [`HttpRemote`] is
//! the production implementation over reqwest.

use std::sync::Arc;

use reqwest::Method;
use serde::Deserialize;
use thiserror::Error;

use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::models::{
    ActionKind, AttendanceBatchPayload, AttendanceSinglePayload, BatchSyncSummary, ChangeRecord,
};
use crate::util::compact_text;

const SYNC_BATCH_PATH: &str = "/attendance/records/sync_batch/";
const RECORDS_PATH: &str = "/attendance/records/";
const EXCEPTIONS_PATH: &str = "/attendance/exceptions/";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Invalid remote configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Remote HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Remote unreachable: {0}")]
    Unreachable(String),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

impl From<RemoteError> for Error {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::InvalidConfiguration(message) => Self::InvalidInput(message),
            RemoteError::Http(error) => Self::TransientNetwork(error.to_string()),
            RemoteError::Unreachable(message) => Self::TransientNetwork(message),
        }
    }
}

/// One HTTP call derived from a change-record
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: Method,
    /// Path below the API root, starting with `/`
    pub path: &'static str,
    pub body: serde_json::Value,
}

impl RemoteRequest {
    /// Build the request for a queued change.
    ///
    /// Unknown action kinds and payloads that do not fit the action's wire
    /// shape can never succeed and are reported as [`Error::PermanentAction`].
    pub fn for_change(change: &ChangeRecord) -> Result<Self> {
        let (path, body) = match &change.action {
            ActionKind::AttendanceBatch => {
                let payload: AttendanceBatchPayload = decode_payload(change)?;
                (SYNC_BATCH_PATH, serde_json::to_value(payload)?)
            }
            ActionKind::AttendanceSingle => {
                let payload: AttendanceSinglePayload = decode_payload(change)?;
                (RECORDS_PATH, serde_json::to_value(payload.into_wire())?)
            }
            ActionKind::Exception => (EXCEPTIONS_PATH, change.payload.clone()),
            ActionKind::Unrecognized(kind) => {
                return Err(Error::PermanentAction(format!("unknown action kind: {kind}")))
            }
        };

        Ok(Self {
            method: Method::POST,
            path,
            body,
        })
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(change: &ChangeRecord) -> Result<T> {
    serde_json::from_value(change.payload.clone()).map_err(|error| {
        Error::PermanentAction(format!("malformed {} payload: {error}", change.action))
    })
}

/// Status and raw body of a remote reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: String,
}

impl RemoteResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Summary of a batch upload, when the body carries one
    pub fn batch_summary(&self) -> Option<BatchSyncSummary> {
        serde_json::from_str(&self.body).ok()
    }

    /// Short, human-readable description of a failed reply
    pub fn error_message(&self) -> String {
        if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(&self.body) {
            if let Some(message) = payload.detail.or(payload.message).or(payload.error) {
                return format!("{} ({})", compact_text(&message), self.status);
            }
        }

        let trimmed = compact_text(&self.body);
        if trimmed.is_empty() {
            format!("HTTP {}", self.status)
        } else {
            format!("{trimmed} ({})", self.status)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    detail: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

/// Transport to the remote system.
///
/// `Ok` means a reply was received, whatever its status; `Err` means the
/// request never completed (no connectivity, timeout, TLS failure).
#[allow(async_fn_in_trait)]
pub trait RemoteApi {
    async fn dispatch(&self, request: &RemoteRequest) -> RemoteResult<RemoteResponse>;
}

impl<R: RemoteApi> RemoteApi for Arc<R> {
    async fn dispatch(&self, request: &RemoteRequest) -> RemoteResult<RemoteResponse> {
        (**self).dispatch(request).await
    }
}

/// reqwest-backed [`RemoteApi`]
#[derive(Clone)]
pub struct HttpRemote {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(config: &RemoteConfig) -> RemoteResult<Self> {
        if config.request_timeout.is_zero() {
            return Err(RemoteError::InvalidConfiguration(
                "request timeout must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            base_url: config.base_url.clone(),
            auth_token: config.auth_token.clone(),
            client: reqwest::Client::builder()
                .timeout(config.request_timeout)
                .build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl RemoteApi for HttpRemote {
    async fn dispatch(&self, request: &RemoteRequest) -> RemoteResult<RemoteResponse> {
        let url = format!("{}{}", self.base_url, request.path);

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header("Accept", "application/json")
            .header("X-Requested-With", "XMLHttpRequest")
            .json(&request.body);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|error| {
            if error.is_connect() || error.is_timeout() {
                RemoteError::Unreachable(error.to_string())
            } else {
                RemoteError::Http(error)
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        tracing::debug!("{} {url} -> {status}", request.method);
        Ok(RemoteResponse { status, body })
    }
}
