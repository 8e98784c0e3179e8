//! Wire shapes sent to the remote system for each action kind

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attendance::{AttendanceRecord, AttendanceStatus};

/// Body of an `attendance_batch` change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceBatchPayload {
    pub session_id: String,
    pub records: Vec<MarkedAttendance>,
}

/// One student's mark inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkedAttendance {
    pub student_id: i64,
    pub status: AttendanceStatus,
    #[serde(default)]
    pub remarks: String,
    pub marked_at: DateTime<Utc>,
}

impl From<&AttendanceRecord> for MarkedAttendance {
    fn from(record: &AttendanceRecord) -> Self {
        Self {
            student_id: record.student_id,
            status: record.status,
            remarks: record.remarks.clone(),
            marked_at: record.marked_at,
        }
    }
}

impl AttendanceBatchPayload {
    /// Build a batch from locally saved records of one session
    pub fn from_records<'a>(
        session_id: impl Into<String>,
        records: impl IntoIterator<Item = &'a AttendanceRecord>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            records: records.into_iter().map(MarkedAttendance::from).collect(),
        }
    }
}

/// Body of an `attendance_single` change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceSinglePayload {
    /// Session id (the remote API names this field `session`)
    pub session: String,
    pub student_id: i64,
    pub status: AttendanceStatus,
    #[serde(default)]
    pub remarks: String,
    /// Local mark time; kept in the queue, never sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marked_at: Option<DateTime<Utc>>,
}

impl AttendanceSinglePayload {
    /// The body the remote endpoint expects
    #[must_use]
    pub fn into_wire(mut self) -> Self {
        self.marked_at = None;
        self
    }
}

impl From<&AttendanceRecord> for AttendanceSinglePayload {
    fn from(record: &AttendanceRecord) -> Self {
        Self {
            session: record.session_id.clone(),
            student_id: record.student_id,
            status: record.status,
            remarks: record.remarks.clone(),
            marked_at: Some(record.marked_at),
        }
    }
}

/// Response summary returned by the batch endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BatchSyncSummary {
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
}
