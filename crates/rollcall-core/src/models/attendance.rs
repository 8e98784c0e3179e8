//! Attendance and session models

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Attendance mark for one student
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    #[serde(rename = "P")]
    Present,
    #[serde(rename = "A")]
    Absent,
    #[serde(rename = "L")]
    Late,
    #[serde(rename = "E")]
    Excused,
}

impl AttendanceStatus {
    /// Human label
    pub const fn label(self) -> &'static str {
        match self {
            Self::Present => "Present",
            Self::Absent => "Absent",
            Self::Late => "Late",
            Self::Excused => "Excused",
        }
    }
}

/// Local copy of a student's attendance within a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    /// `{session_id}_{student_id}`
    pub id: String,
    pub session_id: String,
    pub student_id: i64,
    pub status: AttendanceStatus,
    #[serde(default)]
    pub remarks: String,
    /// Whether the remote system has acknowledged this mark
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    /// Domain timestamp used for conflict resolution
    pub marked_at: DateTime<Utc>,
    /// Last local save
    pub saved_at: DateTime<Utc>,
}

impl AttendanceRecord {
    /// Create an unsynced mark, timestamped now
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        student_id: i64,
        status: AttendanceStatus,
        remarks: impl Into<String>,
    ) -> Self {
        let session_id = session_id.into();
        let now = Utc::now();
        Self {
            id: Self::record_id(&session_id, student_id),
            session_id,
            student_id,
            status,
            remarks: remarks.into(),
            synced: false,
            synced_at: None,
            marked_at: now,
            saved_at: now,
        }
    }

    /// Deterministic id so re-marking a student overwrites the earlier mark
    pub fn record_id(session_id: &str, student_id: i64) -> String {
        format!("{session_id}_{student_id}")
    }
}

/// Lifecycle of an attendance session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Open,
    Closed,
}

/// Local copy of an attendance session (class + date)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub class_id: i64,
    pub date: NaiveDate,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub teacher_id: Option<i64>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub record_count: usize,
    pub saved_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Create an open, unsynced session
    #[must_use]
    pub fn new(id: impl Into<String>, class_id: i64, date: NaiveDate) -> Self {
        Self {
            id: id.into(),
            class_id,
            date,
            subject: None,
            teacher_id: None,
            status: SessionStatus::Open,
            synced: false,
            record_count: 0,
            saved_at: Utc::now(),
        }
    }

    /// Session id used when the UI has not been given one by the server
    pub fn local_session_id(class_id: i64, date: NaiveDate) -> String {
        format!(
            "session_{class_id}_{date}_{}",
            Utc::now().timestamp_millis()
        )
    }
}
