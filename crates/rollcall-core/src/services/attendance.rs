//! Attendance capture: local save first, remote delivery through the queue.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;

use crate::error::{Error, Result};
use crate::models::{
    ActionKind, AttendanceBatchPayload, AttendanceRecord, AttendanceSinglePayload,
    AttendanceStatus, ChangeRecord, SessionRecord,
};
use crate::queue::MutationQueue;
use crate::store::{AttendanceRepository, LocalStore, StorageBackend};
use crate::tenant::TenantId;
use crate::util::normalize_text_option;

/// Marks taken for one class on one day, not yet saved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceDraft {
    /// Server-issued session id; a local one is generated when absent
    pub session_id: Option<String>,
    pub class_id: i64,
    pub date: NaiveDate,
    pub subject: Option<String>,
    pub teacher_id: Option<i64>,
    marks: BTreeMap<i64, (AttendanceStatus, String)>,
}

impl AttendanceDraft {
    pub fn new(class_id: i64, date: NaiveDate) -> Self {
        Self {
            session_id: None,
            class_id,
            date,
            subject: None,
            teacher_id: None,
            marks: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = normalize_text_option(Some(session_id.into()));
        self
    }

    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = normalize_text_option(Some(subject.into()));
        self
    }

    #[must_use]
    pub const fn with_teacher(mut self, teacher_id: i64) -> Self {
        self.teacher_id = Some(teacher_id);
        self
    }

    /// Set a student's mark, replacing any earlier one
    pub fn mark(&mut self, student_id: i64, status: AttendanceStatus, remarks: impl Into<String>) {
        self.marks.insert(student_id, (status, remarks.into()));
    }

    /// Mark every listed student present
    pub fn mark_all_present(&mut self, student_ids: impl IntoIterator<Item = i64>) {
        for student_id in student_ids {
            self.mark(student_id, AttendanceStatus::Present, "");
        }
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Tally by status
    pub fn counts(&self) -> AttendanceCounts {
        let mut counts = AttendanceCounts::default();
        for (status, _) in self.marks.values() {
            match status {
                AttendanceStatus::Present => counts.present += 1,
                AttendanceStatus::Absent => counts.absent += 1,
                AttendanceStatus::Late => counts.late += 1,
                AttendanceStatus::Excused => counts.excused += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttendanceCounts {
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub excused: usize,
}

/// Result of saving a draft
#[derive(Debug, Clone, PartialEq)]
pub struct SavedAttendance {
    pub session: SessionRecord,
    pub records: Vec<AttendanceRecord>,
    pub change: ChangeRecord,
}

/// Writes attendance locally and queues it for the remote system
pub struct AttendanceRecorder<B> {
    store: Arc<LocalStore<B>>,
    queue: Arc<MutationQueue<B>>,
}

impl<B: StorageBackend> AttendanceRecorder<B> {
    pub fn new(store: Arc<LocalStore<B>>, queue: Arc<MutationQueue<B>>) -> Self {
        Self { store, queue }
    }

    /// Save every mark and the session, then queue one `attendance_batch` change.
    ///
    /// Writes are rejected without an active tenant. Record and session writes
    /// are independent; a later save of the same draft converges.
    pub async fn save_attendance(
        &self,
        tenant: Option<&TenantId>,
        draft: AttendanceDraft,
    ) -> Result<SavedAttendance> {
        let tenant = tenant.ok_or(Error::TenantMissing)?;
        if draft.is_empty() {
            return Err(Error::InvalidInput(
                "attendance draft has no marks".to_string(),
            ));
        }

        let repo = AttendanceRepository::new(self.store.as_ref());
        let session_id = draft
            .session_id
            .clone()
            .unwrap_or_else(|| SessionRecord::local_session_id(draft.class_id, draft.date));

        let mut records = Vec::with_capacity(draft.len());
        for (student_id, (status, remarks)) in &draft.marks {
            let record = AttendanceRecord::new(session_id.clone(), *student_id, *status, remarks.clone());
            repo.save_record(tenant, &record).await?;
            records.push(record);
        }

        let mut session = SessionRecord::new(session_id.clone(), draft.class_id, draft.date);
        session.subject = draft.subject;
        session.teacher_id = draft.teacher_id;
        session.record_count = records.len();
        repo.save_session(tenant, &session).await?;

        let payload = AttendanceBatchPayload::from_records(session_id, &records);
        let change = self
            .queue
            .enqueue(tenant, ActionKind::AttendanceBatch, serde_json::to_value(&payload)?)
            .await?;

        tracing::info!(
            "Saved {} attendance mark(s) for session {}",
            records.len(),
            session.id
        );
        Ok(SavedAttendance {
            session,
            records,
            change,
        })
    }

    /// Save one student's mark and queue an `attendance_single` change
    pub async fn mark_single(
        &self,
        tenant: Option<&TenantId>,
        session_id: &str,
        student_id: i64,
        status: AttendanceStatus,
        remarks: &str,
    ) -> Result<(AttendanceRecord, ChangeRecord)> {
        let tenant = tenant.ok_or(Error::TenantMissing)?;
        let record = AttendanceRecord::new(session_id, student_id, status, remarks);
        AttendanceRepository::new(self.store.as_ref())
            .save_record(tenant, &record)
            .await?;

        let payload = AttendanceSinglePayload::from(&record);
        let change = self
            .queue
            .enqueue(tenant, ActionKind::AttendanceSingle, serde_json::to_value(&payload)?)
            .await?;
        Ok((record, change))
    }

    /// Queue an attendance exception; the payload is forwarded as-is
    pub async fn record_exception(
        &self,
        tenant: Option<&TenantId>,
        exception: serde_json::Value,
    ) -> Result<ChangeRecord> {
        let tenant = tenant.ok_or(Error::TenantMissing)?;
        self.queue
            .enqueue(tenant, ActionKind::Exception, exception)
            .await
    }
}
