//! Attendance repository over the tenant-partitioned store

use chrono::{DateTime, NaiveDate, Utc};

use super::{Collection, ListFilter, LocalStore, StorageBackend};
use crate::error::Result;
use crate::models::{AttendanceRecord, SessionRecord};
use crate::tenant::TenantId;

/// Typed access to attendance records and sessions
pub struct AttendanceRepository<'a, B> {
    store: &'a LocalStore<B>,
}

impl<'a, B: StorageBackend> AttendanceRepository<'a, B> {
    /// Create a new repository over the given store
    pub const fn new(store: &'a LocalStore<B>) -> Self {
        Self { store }
    }

    /// Insert or overwrite a student's mark
    pub async fn save_record(&self, tenant: &TenantId, record: &AttendanceRecord) -> Result<()> {
        self.store
            .put_value(tenant, Collection::AttendanceRecords, record.id.clone(), record)
            .await?;
        Ok(())
    }

    pub async fn get_record(
        &self,
        tenant: Option<&TenantId>,
        id: &str,
    ) -> Result<Option<AttendanceRecord>> {
        self.store
            .get_as(tenant, Collection::AttendanceRecords, id)
            .await
    }

    /// All marks taken in a session
    pub async fn session_attendance(
        &self,
        tenant: Option<&TenantId>,
        session_id: &str,
    ) -> Result<Vec<AttendanceRecord>> {
        let filter = ListFilter::all().field_eq("session_id", session_id);
        self.store
            .list_as(tenant, Collection::AttendanceRecords, &filter)
            .await
    }

    /// A student's most recent marks, newest first
    pub async fn student_attendance(
        &self,
        tenant: Option<&TenantId>,
        student_id: i64,
        limit: usize,
    ) -> Result<Vec<AttendanceRecord>> {
        let filter = ListFilter::all().field_eq("student_id", student_id);
        let mut records: Vec<AttendanceRecord> = self
            .store
            .list_as(tenant, Collection::AttendanceRecords, &filter)
            .await?;

        records.sort_by(|a, b| b.marked_at.cmp(&a.marked_at));
        records.truncate(limit);
        Ok(records)
    }

    /// Marks not yet acknowledged by the remote system
    pub async fn unsynced_records(
        &self,
        tenant: Option<&TenantId>,
        limit: usize,
    ) -> Result<Vec<AttendanceRecord>> {
        let filter = ListFilter::all().field_eq("synced", false).limit(limit);
        self.store
            .list_as(tenant, Collection::AttendanceRecords, &filter)
            .await
    }

    /// Flag the given marks as synced; unknown ids are skipped.
    ///
    /// Returns how many records were updated.
    pub async fn mark_records_synced(&self, tenant: &TenantId, ids: &[String]) -> Result<usize> {
        let mut updated = 0;
        for id in ids {
            if self.flag_synced(tenant, id, None).await? {
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Flag delivered marks as synced, each only while the local copy is still
    /// the one that was sent (same `marked_at`). A later re-mark stays unsynced.
    pub async fn mark_delivered(
        &self,
        tenant: &TenantId,
        delivered: &[(String, DateTime<Utc>)],
    ) -> Result<usize> {
        let mut updated = 0;
        for (id, marked_at) in delivered {
            if self.flag_synced(tenant, id, Some(*marked_at)).await? {
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn flag_synced(
        &self,
        tenant: &TenantId,
        id: &str,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let Some(mut record) = self.get_record(Some(tenant), id).await? else {
            return Ok(false);
        };
        if sent_at.is_some_and(|sent_at| sent_at != record.marked_at) {
            tracing::debug!("Record {id} was re-marked after it was queued; leaving it unsynced");
            return Ok(false);
        }
        record.synced = true;
        record.synced_at = Some(Utc::now());
        self.save_record(tenant, &record).await?;
        Ok(true)
    }

    pub async fn save_session(&self, tenant: &TenantId, session: &SessionRecord) -> Result<()> {
        self.store
            .put_value(tenant, Collection::AttendanceSessions, session.id.clone(), session)
            .await?;
        Ok(())
    }

    pub async fn get_session(
        &self,
        tenant: Option<&TenantId>,
        id: &str,
    ) -> Result<Option<SessionRecord>> {
        self.store
            .get_as(tenant, Collection::AttendanceSessions, id)
            .await
    }

    /// Sessions held for a class on a given day
    pub async fn sessions_for(
        &self,
        tenant: Option<&TenantId>,
        class_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<SessionRecord>> {
        let filter = ListFilter::all()
            .field_eq("class_id", class_id)
            .field_eq("date", date.to_string());
        self.store
            .list_as(tenant, Collection::AttendanceSessions, &filter)
            .await
    }

    /// Flag a session as synced; returns `false` if it is not stored locally
    pub async fn mark_session_synced(&self, tenant: &TenantId, session_id: &str) -> Result<bool> {
        let Some(mut session) = self.get_session(Some(tenant), session_id).await? else {
            return Ok(false);
        };
        session.synced = true;
        self.save_session(tenant, &session).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttendanceStatus;
    use crate::store::MemoryBackend;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn tenant(id: &str) -> TenantId {
        id.parse().unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    #[tokio::test]
    async fn save_and_get_record() {
        let store = LocalStore::new(MemoryBackend::new());
        let repo = AttendanceRepository::new(&store);
        let a = tenant("a");

        let record = AttendanceRecord::new("S1", 42, AttendanceStatus::Late, "bus");
        repo.save_record(&a, &record).await.unwrap();

        let fetched = repo.get_record(Some(&a), "S1_42").await.unwrap().unwrap();
        assert_eq!(fetched, record);
        assert!(repo.get_record(Some(&tenant("b")), "S1_42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn re_marking_overwrites_previous_mark() {
        let store = LocalStore::new(MemoryBackend::new());
        let repo = AttendanceRepository::new(&store);
        let a = tenant("a");

        repo.save_record(&a, &AttendanceRecord::new("S1", 1, AttendanceStatus::Absent, ""))
            .await
            .unwrap();
        repo.save_record(&a, &AttendanceRecord::new("S1", 1, AttendanceStatus::Present, ""))
            .await
            .unwrap();

        let marks = repo.session_attendance(Some(&a), "S1").await.unwrap();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].status, AttendanceStatus::Present);
    }

    #[tokio::test]
    async fn session_attendance_filters_by_session() {
        let store = LocalStore::new(MemoryBackend::new());
        let repo = AttendanceRepository::new(&store);
        let a = tenant("a");

        for (session, student) in [("S1", 1), ("S1", 2), ("S2", 1)] {
            repo.save_record(&a, &AttendanceRecord::new(session, student, AttendanceStatus::Present, ""))
                .await
                .unwrap();
        }

        let students: Vec<i64> = repo
            .session_attendance(Some(&a), "S1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.student_id)
            .collect();
        assert_eq!(students, vec![1, 2]);
    }

    #[tokio::test]
    async fn student_attendance_returns_latest_first() {
        let store = LocalStore::new(MemoryBackend::new());
        let repo = AttendanceRepository::new(&store);
        let a = tenant("a");
        let base = Utc::now();

        for (offset, session) in ["S1", "S2", "S3"].into_iter().enumerate() {
            let mut record = AttendanceRecord::new(session, 7, AttendanceStatus::Present, "");
            record.marked_at = base + Duration::minutes(i64::try_from(offset).unwrap());
            repo.save_record(&a, &record).await.unwrap();
        }

        let sessions: Vec<String> = repo
            .student_attendance(Some(&a), 7, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.session_id)
            .collect();
        assert_eq!(sessions, vec!["S3".to_string(), "S2".to_string()]);
    }

    #[tokio::test]
    async fn mark_records_synced_updates_unsynced_view() {
        let store = LocalStore::new(MemoryBackend::new());
        let repo = AttendanceRepository::new(&store);
        let a = tenant("a");

        for student in 1..=3 {
            repo.save_record(&a, &AttendanceRecord::new("S1", student, AttendanceStatus::Present, ""))
                .await
                .unwrap();
        }
        assert_eq!(repo.unsynced_records(Some(&a), 10).await.unwrap().len(), 3);
        assert_eq!(repo.unsynced_records(Some(&a), 2).await.unwrap().len(), 2);

        let updated = repo
            .mark_records_synced(&a, &["S1_1".to_string(), "S1_2".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let unsynced = repo.unsynced_records(Some(&a), 10).await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].id, "S1_3");

        let synced = repo.get_record(Some(&a), "S1_1").await.unwrap().unwrap();
        assert!(synced.synced);
        assert!(synced.synced_at.is_some());
    }

    #[tokio::test]
    async fn sessions_round_trip_and_filter_by_class_and_date() {
        let store = LocalStore::new(MemoryBackend::new());
        let repo = AttendanceRepository::new(&store);
        let a = tenant("a");

        repo.save_session(&a, &SessionRecord::new("S1", 7, date())).await.unwrap();
        repo.save_session(&a, &SessionRecord::new("S2", 8, date())).await.unwrap();
        repo.save_session(&a, &SessionRecord::new("S3", 7, date().succ_opt().unwrap()))
            .await
            .unwrap();

        let found = repo.sessions_for(Some(&a), 7, date()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "S1");

        assert!(repo.mark_session_synced(&a, "S1").await.unwrap());
        assert!(!repo.mark_session_synced(&a, "nope").await.unwrap());
        assert!(repo.get_session(Some(&a), "S1").await.unwrap().unwrap().synced);
    }

    #[tokio::test]
    async fn mark_delivered_skips_newer_local_mark() {
        let store = LocalStore::new(MemoryBackend::new());
        let repo = AttendanceRepository::new(&store);
        let a = tenant("a");

        let sent = AttendanceRecord::new("S1", 1, AttendanceStatus::Present, "");
        let untouched = AttendanceRecord::new("S1", 2, AttendanceStatus::Present, "");
        repo.save_record(&a, &sent).await.unwrap();
        repo.save_record(&a, &untouched).await.unwrap();

        let mut remarked = AttendanceRecord::new("S1", 1, AttendanceStatus::Absent, "");
        remarked.marked_at = sent.marked_at + Duration::seconds(5);
        repo.save_record(&a, &remarked).await.unwrap();

        let updated = repo
            .mark_delivered(
                &a,
                &[
                    (sent.id.clone(), sent.marked_at),
                    (untouched.id.clone(), untouched.marked_at),
                ],
            )
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let first = repo.get_record(Some(&a), "S1_1").await.unwrap().unwrap();
        assert_eq!(first.status, AttendanceStatus::Absent);
        assert!(!first.synced);
        assert!(repo.get_record(Some(&a), "S1_2").await.unwrap().unwrap().synced);
    }
}
