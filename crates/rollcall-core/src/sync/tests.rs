use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::watch;

use super::*;
use crate::config::SyncConfig;
use crate::models::{ActionKind, AttendanceStatus};
use crate::queue::MutationQueue;
use crate::services::{AttendanceDraft, AttendanceRecorder};
use crate::state::SyncStatus;
use crate::store::{AttendanceRepository, Collection, ListFilter, LocalStore, MemoryBackend};
use crate::tenant::{ActiveTenant, TenantId, TenantResolver};

#[derive(Debug, Clone, Copy)]
enum Reply {
    Status(u16),
    Unreachable,
}

/// Remote that answers from a script, then with 200 once the script runs out
struct ScriptedRemote {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<RemoteRequest>>,
}

impl ScriptedRemote {
    fn calls(&self) -> Vec<RemoteRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn paths(&self) -> Vec<&'static str> {
        self.calls().iter().map(|call| call.path).collect()
    }
}

impl RemoteApi for ScriptedRemote {
    async fn dispatch(&self, request: &RemoteRequest) -> RemoteResult<RemoteResponse> {
        self.calls.lock().unwrap().push(request.clone());
        tokio::task::yield_now().await;

        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Status(200));
        match reply {
            Reply::Status(status) => Ok(RemoteResponse::new(status, "{}")),
            Reply::Unreachable => Err(RemoteError::Unreachable("connection refused".to_string())),
        }
    }
}

type Backend = Arc<MemoryBackend>;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

struct Harness {
    backend: Arc<MemoryBackend>,
    store: Arc<LocalStore<Backend>>,
    queue: Arc<MutationQueue<Backend>>,
    remote: Arc<ScriptedRemote>,
    tenants: Arc<ActiveTenant>,
    recorder: AttendanceRecorder<Backend>,
    engine: SyncEngine<Backend, Arc<ScriptedRemote>>,
}

impl Harness {
    fn new(config: SyncConfig, replies: impl IntoIterator<Item = Reply>) -> Self {
        init_tracing();
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(LocalStore::new(Arc::clone(&backend)));
        let queue = Arc::new(MutationQueue::new(Arc::clone(&store)));
        let remote = Arc::new(ScriptedRemote {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: Mutex::default(),
        });
        let tenants = Arc::new(ActiveTenant::with_tenant(school("school-1")));
        let resolver: Arc<dyn TenantResolver> = tenants.clone();
        let recorder = AttendanceRecorder::new(Arc::clone(&store), Arc::clone(&queue));
        let engine = SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&remote),
            resolver,
            config,
        )
        .unwrap();

        Self {
            backend,
            store,
            queue,
            remote,
            tenants,
            recorder,
            engine,
        }
    }

    fn online(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self::new(
            SyncConfig::default()
                .without_auto_sync()
                .with_start_online(true),
            replies,
        )
    }

    fn repo(&self) -> AttendanceRepository<'_, Backend> {
        AttendanceRepository::new(self.store.as_ref())
    }

    async fn save_session(&self, tenant: &TenantId, session_id: &str, students: &[i64]) {
        let mut draft = AttendanceDraft::new(7, day()).with_session_id(session_id);
        draft.mark_all_present(students.iter().copied());
        self.recorder
            .save_attendance(Some(tenant), draft)
            .await
            .unwrap();
    }
}

fn school(id: &str) -> TenantId {
    id.parse().unwrap()
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
}

#[tokio::test]
async fn going_online_delivers_batch_and_marks_records_synced() {
    let h = Harness::new(SyncConfig::default().without_auto_sync(), []);
    let tenant = school("school-1");
    h.save_session(&tenant, "S1", &[1, 2]).await;
    assert_eq!(h.queue.len().await, 1);
    assert_eq!(*h.engine.subscribe_status().borrow(), SyncStatus::Offline);

    let outcome = h.engine.handle_online().await;
    assert_eq!(
        outcome,
        SyncOutcome::Completed(SyncReport {
            synced: 1,
            retried: 0,
            failed: 0
        })
    );
    assert_eq!(h.remote.paths(), vec!["/attendance/records/sync_batch/"]);
    assert!(h.queue.is_empty().await);

    let records = h.repo().session_attendance(Some(&tenant), "S1").await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|record| record.synced && record.synced_at.is_some()));
    assert!(h.repo().get_session(Some(&tenant), "S1").await.unwrap().unwrap().synced);
    assert_eq!(*h.engine.subscribe_status().borrow(), SyncStatus::Synced);
}

#[tokio::test]
async fn unknown_action_fails_immediately_without_remote_call() {
    let h = Harness::online([]);
    let tenant = school("school-1");
    let mut notices = h.engine.subscribe_notices();
    let bogus = h
        .queue
        .enqueue(&tenant, ActionKind::from("bogus"), json!({}))
        .await
        .unwrap();

    let report = h.engine.sync_pending().await.report().unwrap();
    assert_eq!(report.failed, 1);
    assert!(h.remote.calls().is_empty());
    assert_eq!(h.engine.scheduled_retries(), 0);
    assert!(h.queue.is_empty().await);

    match notices.try_recv().unwrap() {
        SyncNotice::PermanentFailure {
            change_id, reason, ..
        } => {
            assert_eq!(change_id, bogus.id);
            assert!(reason.contains("bogus"));
        }
        other => panic!("unexpected notice {other:?}"),
    }
    assert!(matches!(
        notices.try_recv().unwrap(),
        SyncNotice::PassCompleted { .. }
    ));

    let failed = h.queue.failed_for_tenant(&tenant).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, bogus.id);
}

#[tokio::test]
async fn retry_budget_moves_change_to_failed() {
    let h = Harness::online([Reply::Status(500), Reply::Status(500), Reply::Status(500)]);
    let tenant = school("school-1");
    h.save_session(&tenant, "S1", &[1]).await;

    for attempt in 1..=2 {
        let report = h.engine.sync_pending().await.report().unwrap();
        assert_eq!(report.retried, 1);
        let pending = h.queue.pending_for_tenant(&tenant).await;
        assert_eq!(pending[0].retry_count, attempt);
    }
    // Error replies are retried on the next pass, not on a timer
    assert_eq!(h.engine.scheduled_retries(), 0);

    let report = h.engine.sync_pending().await.report().unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.remote.calls().len(), 3);
    assert_eq!(
        h.engine.sync_pending().await,
        SyncOutcome::Skipped(SkipReason::QueueEmpty)
    );
    assert_eq!(h.remote.calls().len(), 3);

    let failed = h.queue.failed_for_tenant(&tenant).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retry_count, 3);
    assert!(failed[0].last_error.as_deref().unwrap().contains("500"));

    let records = h.repo().session_attendance(Some(&tenant), "S1").await.unwrap();
    assert!(!records[0].synced);
}

#[tokio::test]
async fn transient_failures_are_delivered_eventually() {
    let h = Harness::online([Reply::Unreachable, Reply::Status(503)]);
    let tenant = school("school-1");
    h.save_session(&tenant, "S1", &[1]).await;

    assert_eq!(h.engine.sync_pending().await.report().unwrap().retried, 1);
    assert_eq!(h.engine.scheduled_retries(), 1);
    let pending = h.queue.pending_for_tenant(&tenant).await;
    assert_eq!(
        pending[0].last_error.as_deref(),
        Some("Transient network failure: connection refused")
    );
    assert_eq!(h.engine.sync_pending().await.report().unwrap().retried, 1);
    assert_eq!(h.engine.sync_pending().await.report().unwrap().synced, 1);

    assert_eq!(h.remote.calls().len(), 3);
    assert_eq!(h.engine.scheduled_retries(), 0);
    assert!(h.queue.is_empty().await);
    let records = h.repo().session_attendance(Some(&tenant), "S1").await.unwrap();
    assert!(records[0].synced);
}

#[tokio::test]
async fn batch_delivery_leaves_later_mark_unsynced() {
    let h = Harness::online([Reply::Status(200), Reply::Status(500)]);
    let tenant = school("school-1");
    h.save_session(&tenant, "S1", &[1, 2]).await;
    tokio::time::sleep(Duration::from_millis(2)).await;
    h.recorder
        .mark_single(Some(&tenant), "S1", 1, AttendanceStatus::Absent, "")
        .await
        .unwrap();

    let report = h.engine.sync_pending().await.report().unwrap();
    assert_eq!(
        report,
        SyncReport {
            synced: 1,
            retried: 1,
            failed: 0
        }
    );
    assert_eq!(h.queue.len().await, 1);

    let remarked = h.repo().get_record(Some(&tenant), "S1_1").await.unwrap().unwrap();
    assert_eq!(remarked.status, AttendanceStatus::Absent);
    assert!(!remarked.synced);
    assert!(h.repo().get_record(Some(&tenant), "S1_2").await.unwrap().unwrap().synced);

    assert_eq!(h.engine.sync_pending().await.report().unwrap().synced, 1);
    assert!(h.repo().get_record(Some(&tenant), "S1_1").await.unwrap().unwrap().synced);
}

#[tokio::test]
async fn pass_only_touches_active_tenant() {
    let h = Harness::online([]);
    let first = school("school-1");
    let second = school("school-2");
    h.save_session(&first, "SA", &[1]).await;
    h.tenants.switch_to(second.clone());
    h.save_session(&second, "SB", &[1]).await;

    assert_eq!(h.engine.sync_pending().await.report().unwrap().synced, 1);
    let calls = h.remote.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].body["session_id"], "SB");
    assert_eq!(h.queue.len_for_tenant(&first).await, 1);
    assert_eq!(h.engine.snapshot().await.unwrap().pending_count, 0);

    let untouched = h.repo().session_attendance(Some(&first), "SA").await.unwrap();
    assert!(!untouched[0].synced);

    h.tenants.switch_to(first.clone());
    assert_eq!(h.engine.sync_pending().await.report().unwrap().synced, 1);
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn changes_are_sent_in_creation_order() {
    let h = Harness::online([]);
    let tenant = school("school-1");
    for student in [3, 1, 2] {
        h.recorder
            .mark_single(Some(&tenant), "S1", student, AttendanceStatus::Late, "")
            .await
            .unwrap();
    }

    assert_eq!(h.engine.sync_pending().await.report().unwrap().synced, 3);
    let students: Vec<i64> = h
        .remote
        .calls()
        .iter()
        .map(|call| call.body["student_id"].as_i64().unwrap())
        .collect();
    assert_eq!(students, vec![3, 1, 2]);
    assert_eq!(h.remote.paths(), vec!["/attendance/records/"; 3]);
}

#[tokio::test]
async fn concurrent_passes_do_not_overlap() {
    let h = Harness::online([]);
    let tenant = school("school-1");
    h.save_session(&tenant, "S1", &[1]).await;

    let (first, second) = tokio::join!(h.engine.sync_pending(), h.engine.sync_pending());
    let outcomes = [first, second];
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| **outcome == SyncOutcome::Skipped(SkipReason::AlreadySyncing))
            .count(),
        1
    );
    assert!(outcomes.iter().any(|outcome| outcome.report().is_some()));
    assert_eq!(h.remote.calls().len(), 1);
    assert!(!h.engine.is_syncing());
}

#[tokio::test]
async fn change_queued_during_pass_waits_for_next_pass() {
    let h = Harness::online([]);
    let tenant = school("school-1");
    h.save_session(&tenant, "S1", &[1]).await;

    let (outcome, queued) = tokio::join!(h.engine.sync_pending(), async {
        h.recorder
            .mark_single(Some(&tenant), "S1", 2, AttendanceStatus::Absent, "")
            .await
            .unwrap()
    });
    assert_eq!(outcome.report().unwrap().synced, 1);
    assert_eq!(h.remote.calls().len(), 1);
    assert!(h.queue.get(&queued.1.id).await.is_some());

    assert_eq!(h.engine.sync_pending().await.report().unwrap().synced, 1);
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn storage_outage_during_pass_is_flushed_later() {
    let h = Harness::online([]);
    let tenant = school("school-1");
    h.recorder
        .record_exception(Some(&tenant), json!({ "student_id": 1, "reason": "medical" }))
        .await
        .unwrap();

    h.backend.set_available(false);
    assert_eq!(h.engine.sync_pending().await.report().unwrap().synced, 1);
    assert_eq!(h.remote.paths(), vec!["/attendance/exceptions/"]);
    assert!(h.queue.is_empty().await);
    assert!(h.queue.has_unflushed().await);

    h.backend.set_available(true);
    assert_eq!(
        h.engine.sync_pending().await,
        SyncOutcome::Skipped(SkipReason::QueueEmpty)
    );
    assert!(!h.queue.has_unflushed().await);
    let persisted = h
        .store
        .list(Some(&tenant), Collection::SyncQueue, &ListFilter::all())
        .await
        .unwrap();
    assert!(persisted.is_empty());
}

#[tokio::test]
async fn queued_while_store_down_still_syncs() {
    let h = Harness::online([]);
    let tenant = school("school-1");
    h.backend.set_available(false);
    h.recorder
        .record_exception(Some(&tenant), json!({ "student_id": 4 }))
        .await
        .unwrap();
    assert!(h.queue.has_unflushed().await);

    h.backend.set_available(true);
    assert_eq!(h.engine.sync_pending().await.report().unwrap().synced, 1);
    assert!(!h.queue.has_unflushed().await);
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn status_and_snapshot_follow_connectivity_and_queue() {
    let h = Harness::new(SyncConfig::default().without_auto_sync(), []);
    let tenant = school("school-1");
    let status = h.engine.subscribe_status();
    h.save_session(&tenant, "S1", &[1]).await;
    h.save_session(&tenant, "S2", &[1]).await;

    assert_eq!(
        h.engine.auto_sync().await,
        SyncOutcome::Skipped(SkipReason::Offline)
    );
    assert_eq!(status.borrow().to_string(), "Offline");

    assert!(h.engine.set_online(true).await);
    assert!(!h.engine.set_online(true).await);
    assert_eq!(*status.borrow(), SyncStatus::Pending(2));
    assert_eq!(status.borrow().to_string(), "2 pending");

    let snapshot = h.engine.snapshot().await.unwrap();
    assert_eq!(
        snapshot,
        SyncSnapshot {
            tenant_id: Some(tenant.clone()),
            is_online: true,
            is_syncing: false,
            pending_count: 2,
            failed_count: 0,
            last_sync_at: None,
        }
    );

    assert_eq!(h.engine.auto_sync().await.report().unwrap().synced, 2);
    assert_eq!(status.borrow().to_string(), "Synced");
    assert!(h.engine.snapshot().await.unwrap().last_sync_at.is_some());

    h.engine.handle_offline().await;
    assert_eq!(*status.borrow(), SyncStatus::Offline);
}

#[tokio::test]
async fn pass_without_tenant_is_skipped() {
    let h = Harness::online([]);
    h.save_session(&school("school-1"), "S1", &[1]).await;
    h.tenants.clear();

    assert_eq!(
        h.engine.sync_pending().await,
        SyncOutcome::Skipped(SkipReason::NoTenant)
    );
    assert!(h.remote.calls().is_empty());
    assert_eq!(h.queue.len().await, 1);
    assert_eq!(h.engine.snapshot().await.unwrap().tenant_id, None);
}

#[tokio::test]
async fn requeued_failure_gets_fresh_budget() {
    let h = Harness::new(
        SyncConfig::default()
            .without_auto_sync()
            .with_start_online(true)
            .with_max_retries(1),
        [Reply::Status(400)],
    );
    let tenant = school("school-1");
    h.save_session(&tenant, "S1", &[1]).await;

    assert_eq!(h.engine.sync_pending().await.report().unwrap().failed, 1);
    let failed = h.queue.failed_for_tenant(&tenant).await.unwrap();
    h.queue.requeue_failed(&tenant, &failed[0].id).await.unwrap();

    assert_eq!(h.engine.sync_pending().await.report().unwrap().synced, 1);
    assert!(h.queue.failed_for_tenant(&tenant).await.unwrap().is_empty());
}

#[tokio::test]
async fn reconcile_through_engine_uses_store() {
    let h = Harness::online([]);
    let tenant = school("school-1");
    let remote = crate::models::AttendanceRecord::new("S1", 9, AttendanceStatus::Absent, "");

    let outcome = h.engine.reconcile_attendance(&tenant, remote).await.unwrap();
    assert_eq!(outcome, Reconciliation::Inserted);
    assert!(h.repo().get_record(Some(&tenant), "S1_9").await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn run_loop_retries_after_backoff() {
    let h = Harness::online([Reply::Unreachable]);
    let tenant = school("school-1");
    h.save_session(&tenant, "S1", &[1]).await;
    let (shutdown, shutdown_rx) = watch::channel(false);

    let driver = async {
        assert_eq!(h.engine.sync_pending().await.report().unwrap().retried, 1);
        assert_eq!(h.engine.scheduled_retries(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.remote.calls().len(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.remote.calls().len(), 2);
        assert!(h.queue.is_empty().await);
        assert_eq!(h.engine.scheduled_retries(), 0);

        shutdown.send(true).unwrap();
    };

    tokio::join!(h.engine.run(shutdown_rx), driver);
}

#[tokio::test(start_paused = true)]
async fn due_retry_of_inactive_tenant_does_not_start_pass() {
    let h = Harness::online([Reply::Unreachable]);
    let first = school("school-1");
    let second = school("school-2");
    h.save_session(&first, "SA", &[1]).await;
    let (shutdown, shutdown_rx) = watch::channel(false);

    let driver = async {
        assert_eq!(h.engine.sync_pending().await.report().unwrap().retried, 1);
        assert_eq!(h.engine.scheduled_retries(), 1);

        h.tenants.switch_to(second.clone());
        h.save_session(&second, "SB", &[1]).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.engine.scheduled_retries(), 0);
        assert_eq!(h.remote.calls().len(), 1);
        assert_eq!(h.queue.len_for_tenant(&second).await, 1);
        assert_eq!(h.queue.len_for_tenant(&first).await, 1);

        shutdown.send(true).unwrap();
    };

    tokio::join!(h.engine.run(shutdown_rx), driver);
}

#[tokio::test(start_paused = true)]
async fn run_loop_syncs_on_reconnect_and_on_timer() {
    let h = Harness::new(
        SyncConfig::default().with_auto_sync_interval(Duration::from_secs(60)),
        [],
    );
    let tenant = school("school-1");
    h.save_session(&tenant, "S1", &[1]).await;
    let (shutdown, shutdown_rx) = watch::channel(false);

    let driver = async {
        // Offline: the timer fires but nothing is sent
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(h.remote.calls().is_empty());

        h.engine.set_online(true).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.remote.calls().len(), 1);
        assert!(h.queue.is_empty().await);

        h.save_session(&tenant, "S2", &[1]).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.remote.calls().len(), 2);
        assert!(h.queue.is_empty().await);

        shutdown.send(true).unwrap();
    };

    tokio::join!(h.engine.run(shutdown_rx), driver);
}
