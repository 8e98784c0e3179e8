//! Change-record (queue entry) model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tenant::TenantId;

/// A unique identifier for a change-record, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeId(Uuid);

impl ChangeId {
    /// Create a new unique change ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChangeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of remote write a change-record represents.
///
/// Unknown kinds survive a round trip through the store so that the sync
/// engine can report them instead of dropping them on load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    AttendanceBatch,
    AttendanceSingle,
    Exception,
    Unrecognized(String),
}

impl ActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AttendanceBatch => "attendance_batch",
            Self::AttendanceSingle => "attendance_single",
            Self::Exception => "exception",
            Self::Unrecognized(kind) => kind,
        }
    }

    pub const fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }
}

impl From<String> for ActionKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "attendance_batch" => Self::AttendanceBatch,
            "attendance_single" => Self::AttendanceSingle,
            "exception" => Self::Exception,
            _ => Self::Unrecognized(value),
        }
    }
}

impl From<&str> for ActionKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<ActionKind> for String {
    fn from(value: ActionKind) -> Self {
        match value {
            ActionKind::Unrecognized(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a change-record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    #[default]
    Pending,
    Synced,
    Failed,
}

/// One logical write waiting to be delivered to the remote system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Unique identifier, ordered by creation time
    pub id: ChangeId,
    /// Remote action to perform
    pub action: ActionKind,
    /// Action-specific data
    pub payload: serde_json::Value,
    /// When the change was queued
    pub created_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub retry_count: u32,
    pub status: ChangeStatus,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Reason of the most recent failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ChangeRecord {
    /// Create a pending change-record for the given tenant
    #[must_use]
    pub fn new(tenant_id: TenantId, action: ActionKind, payload: serde_json::Value) -> Self {
        Self {
            id: ChangeId::new(),
            action,
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            status: ChangeStatus::Pending,
            tenant_id,
            last_error: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ChangeStatus::Pending
    }
}
