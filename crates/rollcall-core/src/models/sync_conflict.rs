//! Sync conflict model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of a conflict was kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictWinner {
    Local,
    Remote,
}

/// Recorded sync conflict resolved by strategy (e.g., LWW)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Record involved in the conflict
    pub record_id: String,
    /// Collection the record lives in
    pub collection: String,
    /// Local copy's domain timestamp
    pub local_timestamp: DateTime<Utc>,
    /// Remote copy's domain timestamp
    pub remote_timestamp: DateTime<Utc>,
    pub winner: ConflictWinner,
    pub resolved_at: DateTime<Utc>,
    /// Resolution strategy name
    pub strategy: String,
}
