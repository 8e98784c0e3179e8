//! Sync engine: drains the mutation queue against the remote system.

use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use super::backoff::{retry_delay, RetryScheduler};
use super::conflict::{reconcile_attendance, Reconciliation};
use super::remote::{RemoteApi, RemoteRequest, RemoteResponse};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{
    ActionKind, AttendanceBatchPayload, AttendanceRecord, AttendanceSinglePayload, ChangeId,
    ChangeRecord, ChangeStatus,
};
use crate::queue::MutationQueue;
use crate::state::SyncStatus;
use crate::store::{AttendanceRepository, LocalStore, StorageBackend};
use crate::tenant::{TenantId, TenantResolver};

const NOTICE_CAPACITY: usize = 64;

/// Why a pass did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadySyncing,
    QueueEmpty,
    NoTenant,
    Offline,
}

/// Tally of one sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    /// Failed attempts that stay queued for another pass
    pub retried: usize,
    /// Entries moved out of the queue for good
    pub failed: usize,
}

impl SyncReport {
    pub const fn attempted(&self) -> usize {
        self.synced + self.retried + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Completed(SyncReport),
}

impl SyncOutcome {
    pub const fn report(&self) -> Option<SyncReport> {
        match self {
            Self::Completed(report) => Some(*report),
            Self::Skipped(_) => None,
        }
    }
}

/// One-time events for the user, separate from the ambient [`SyncStatus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// A change will not be retried automatically
    PermanentFailure {
        change_id: ChangeId,
        action: ActionKind,
        tenant_id: TenantId,
        reason: String,
    },
    PassCompleted {
        tenant_id: TenantId,
        report: SyncReport,
    },
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub tenant_id: Option<TenantId>,
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_count: usize,
    pub failed_count: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
}

enum EntryOutcome {
    Synced,
    Retried,
    Failed,
}

/// Clears the syncing flag when a pass ends, however it ends
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drains queued changes for the active tenant, one pass at a time
pub struct SyncEngine<B, R> {
    store: Arc<LocalStore<B>>,
    queue: Arc<MutationQueue<B>>,
    remote: R,
    tenants: Arc<dyn TenantResolver>,
    config: SyncConfig,
    syncing: AtomicBool,
    online: watch::Sender<bool>,
    status: watch::Sender<SyncStatus>,
    notices: broadcast::Sender<SyncNotice>,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
    scheduler: Mutex<RetryScheduler>,
    /// Wakes the run loop when a retry is scheduled
    rescheduled: Notify,
}

impl<B: StorageBackend, R: RemoteApi> SyncEngine<B, R> {
    pub fn new(
        store: Arc<LocalStore<B>>,
        queue: Arc<MutationQueue<B>>,
        remote: R,
        tenants: Arc<dyn TenantResolver>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        if store.visibility() != config.tenant_visibility {
            tracing::warn!(
                "Store visibility {:?} differs from configured {:?}",
                store.visibility(),
                config.tenant_visibility
            );
        }

        let online = config.start_online;
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Ok(Self {
            store,
            queue,
            remote,
            tenants,
            syncing: AtomicBool::new(false),
            online: watch::Sender::new(online),
            status: watch::Sender::new(SyncStatus::from_parts(online, false, 0)),
            notices,
            last_sync_at: Mutex::new(None),
            scheduler: Mutex::new(RetryScheduler::new()),
            rescheduled: Notify::new(),
            config,
        })
    }

    /// Reload persisted queue entries (call once at startup)
    pub async fn restore(&self) -> Result<usize> {
        let restored = self.queue.restore().await?;
        self.publish_status().await;
        Ok(restored)
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_online(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    /// Record a connectivity report; returns whether it changed anything
    pub async fn set_online(&self, online: bool) -> bool {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                tracing::info!("Connectivity restored");
            } else {
                tracing::info!("Connectivity lost; changes will be queued");
            }
            self.publish_status().await;
        }
        changed
    }

    /// Connectivity came back: run a pass immediately
    pub async fn handle_online(&self) -> SyncOutcome {
        self.set_online(true).await;
        self.sync_pending().await
    }

    pub async fn handle_offline(&self) {
        self.set_online(false).await;
    }

    /// Periodic trigger: sync only while online
    pub async fn auto_sync(&self) -> SyncOutcome {
        if !self.is_online() {
            tracing::debug!("Skipping automatic sync while offline");
            return SyncOutcome::Skipped(SkipReason::Offline);
        }
        self.sync_pending().await
    }

    /// Run one pass over the active tenant's pending changes.
    ///
    /// A call made while another pass is running returns immediately.
    /// Per-entry failures never abort the pass.
    pub async fn sync_pending(&self) -> SyncOutcome {
        let Some(pass) = PassGuard::try_acquire(&self.syncing) else {
            tracing::debug!("Sync already in progress");
            return SyncOutcome::Skipped(SkipReason::AlreadySyncing);
        };

        if self.queue.has_unflushed().await {
            if let Err(error) = self.queue.flush().await {
                tracing::warn!("Queue still not persisted: {error}");
            }
        }
        if self.queue.is_empty().await {
            return SyncOutcome::Skipped(SkipReason::QueueEmpty);
        }
        let Some(tenant) = self.tenants.current_tenant() else {
            tracing::debug!("No active tenant; nothing to sync");
            return SyncOutcome::Skipped(SkipReason::NoTenant);
        };

        self.publish_status().await;
        let entries = self.queue.pending_for_tenant(&tenant).await;
        tracing::info!(
            "Starting sync of {} change(s) for tenant {tenant}",
            entries.len()
        );

        let mut report = SyncReport::default();
        for entry in entries {
            match self.sync_entry(entry).await {
                EntryOutcome::Synced => report.synced += 1,
                EntryOutcome::Retried => report.retried += 1,
                EntryOutcome::Failed => report.failed += 1,
            }
        }

        *lock(&self.last_sync_at) = Some(Utc::now());
        drop(pass);
        self.publish_status().await;

        if report.failed == 0 && report.retried == 0 {
            tracing::info!("All {} change(s) synced", report.synced);
        } else {
            tracing::warn!(
                "{} change(s) synced, {} will be retried, {} failed",
                report.synced,
                report.retried,
                report.failed
            );
        }
        self.notices
            .send(SyncNotice::PassCompleted {
                tenant_id: tenant,
                report,
            })
            .ok();

        SyncOutcome::Completed(report)
    }

    async fn sync_entry(&self, entry: ChangeRecord) -> EntryOutcome {
        let request = match RemoteRequest::for_change(&entry) {
            Ok(request) => request,
            Err(error) => {
                self.fail_permanently(entry, error.to_string()).await;
                return EntryOutcome::Failed;
            }
        };

        match self.remote.dispatch(&request).await {
            Ok(response) if response.is_success() => {
                self.complete(entry, &response).await;
                EntryOutcome::Synced
            }
            Ok(response) => {
                self.record_failure(entry, response.error_message(), false)
                    .await
            }
            Err(error) => {
                let error = Error::from(error);
                let transient = error.is_transient();
                self.record_failure(entry, error.to_string(), transient)
                    .await
            }
        }
    }

    async fn complete(&self, mut entry: ChangeRecord, response: &RemoteResponse) {
        entry.status = ChangeStatus::Synced;
        lock(&self.scheduler).cancel(&entry.id);
        if let Err(error) = self.queue.dequeue(&entry.id).await {
            tracing::warn!("Synced change {} could not be dequeued: {error}", entry.id);
        }
        tracing::debug!("Synced {} change {}", entry.action, entry.id);

        if let Err(error) = self.apply_local_effects(&entry, response).await {
            tracing::warn!(
                "Change {} synced but local records were not updated: {error}",
                entry.id
            );
        }
    }

    /// Mirror a delivered change onto the local attendance data
    async fn apply_local_effects(
        &self,
        entry: &ChangeRecord,
        response: &RemoteResponse,
    ) -> Result<()> {
        let repo = AttendanceRepository::new(self.store.as_ref());
        let tenant = &entry.tenant_id;

        match &entry.action {
            ActionKind::AttendanceBatch => {
                let payload: AttendanceBatchPayload =
                    serde_json::from_value(entry.payload.clone())?;
                let delivered: Vec<(String, DateTime<Utc>)> = payload
                    .records
                    .iter()
                    .map(|mark| {
                        (
                            AttendanceRecord::record_id(&payload.session_id, mark.student_id),
                            mark.marked_at,
                        )
                    })
                    .collect();
                repo.mark_delivered(tenant, &delivered).await?;
                repo.mark_session_synced(tenant, &payload.session_id).await?;

                if let Some(summary) = response.batch_summary() {
                    if !summary.errors.is_empty() {
                        tracing::warn!(
                            "Batch for session {} reported {} error(s)",
                            payload.session_id,
                            summary.errors.len()
                        );
                    }
                }
            }
            ActionKind::AttendanceSingle => {
                let payload: AttendanceSinglePayload =
                    serde_json::from_value(entry.payload.clone())?;
                let id = AttendanceRecord::record_id(&payload.session, payload.student_id);
                match payload.marked_at {
                    Some(marked_at) => repo.mark_delivered(tenant, &[(id, marked_at)]).await?,
                    None => repo.mark_records_synced(tenant, &[id]).await?,
                };
            }
            ActionKind::Exception | ActionKind::Unrecognized(_) => {}
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        mut entry: ChangeRecord,
        reason: String,
        transient: bool,
    ) -> EntryOutcome {
        entry.retry_count += 1;
        entry.last_error = Some(reason.clone());
        lock(&self.scheduler).cancel(&entry.id);

        if entry.retry_count >= self.config.max_retries {
            self.fail_permanently(entry, reason).await;
            return EntryOutcome::Failed;
        }

        tracing::warn!(
            "Sync of change {} failed (attempt {}/{}): {reason}",
            entry.id,
            entry.retry_count,
            self.config.max_retries
        );
        if let Err(error) = self.queue.update(&entry).await {
            tracing::warn!("Could not record retry of change {}: {error}", entry.id);
        }

        // Only transport failures wait on a timer; error replies retry next pass
        if transient {
            let delay = retry_delay(&self.config.retry_delays, entry.retry_count);
            lock(&self.scheduler).schedule(
                entry.id,
                entry.tenant_id.clone(),
                entry.retry_count + 1,
                delay,
            );
            self.rescheduled.notify_one();
        }
        EntryOutcome::Retried
    }

    async fn fail_permanently(&self, mut entry: ChangeRecord, reason: String) {
        entry.last_error = Some(reason.clone());
        lock(&self.scheduler).cancel(&entry.id);

        let notice = SyncNotice::PermanentFailure {
            change_id: entry.id,
            action: entry.action.clone(),
            tenant_id: entry.tenant_id.clone(),
            reason,
        };
        if let Err(error) = self.queue.fail(entry).await {
            tracing::error!("Could not move failed change out of the queue: {error}");
        }
        self.notices.send(notice).ok();
    }

    /// Merge a record fetched from the remote system, last write wins
    pub async fn reconcile_attendance(
        &self,
        tenant: &TenantId,
        remote: AttendanceRecord,
    ) -> Result<Reconciliation> {
        reconcile_attendance(self.store.as_ref(), tenant, remote).await
    }

    /// Current state for status screens
    pub async fn snapshot(&self) -> Result<SyncSnapshot> {
        let tenant_id = self.tenants.current_tenant();
        let (pending_count, failed_count) = match &tenant_id {
            Some(tenant) => (
                self.queue.len_for_tenant(tenant).await,
                self.queue.failed_for_tenant(tenant).await?.len(),
            ),
            None => (self.queue.len().await, 0),
        };

        Ok(SyncSnapshot {
            tenant_id,
            is_online: self.is_online(),
            is_syncing: self.is_syncing(),
            pending_count,
            failed_count,
            last_sync_at: *lock(&self.last_sync_at),
        })
    }

    /// Retries currently waiting for their backoff delay
    pub fn scheduled_retries(&self) -> usize {
        lock(&self.scheduler).len()
    }

    async fn publish_status(&self) {
        let pending = match self.tenants.current_tenant() {
            Some(tenant) => self.queue.len_for_tenant(&tenant).await,
            None => self.queue.len().await,
        };
        let status = SyncStatus::from_parts(self.is_online(), self.is_syncing(), pending);
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    /// Run a pass when a due retry belongs to the active tenant.
    ///
    /// Due retries of other tenants are dropped; their changes stay queued and
    /// go out with the next pass under that tenant.
    async fn run_due_retries(&self) {
        let due = lock(&self.scheduler).take_due(Instant::now());
        let active = self.tenants.current_tenant();

        let mut relevant = 0;
        for retry in &due {
            if active.as_ref() == Some(&retry.tenant_id) {
                tracing::debug!("Attempt {} of change {} is due", retry.attempt, retry.change_id);
                relevant += 1;
            } else {
                tracing::debug!(
                    "Dropping due retry of change {} for inactive tenant {}",
                    retry.change_id,
                    retry.tenant_id
                );
            }
        }

        if relevant > 0 && self.is_online() {
            log_skip(self.sync_pending().await);
        }
    }

    /// Drive the engine until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Runs a pass on every connectivity transition to online, on each
    /// auto-sync tick while online, and whenever a scheduled retry is due.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow_and_update() {
            return;
        }

        let mut online = self.online.subscribe();
        let mut depth = self.queue.subscribe_depth();
        let mut ticker = self.config.auto_sync_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        tracing::info!("Sync engine started");

        loop {
            let next_retry = lock(&self.scheduler).next_due();

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_online = *online.borrow();
                    if is_online {
                        log_skip(self.sync_pending().await);
                    }
                }
                () = tick(ticker.as_mut()) => {
                    log_skip(self.auto_sync().await);
                }
                () = wait_until(next_retry) => self.run_due_retries().await,
                () = self.rescheduled.notified() => {}
                changed = depth.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.publish_status().await;
                }
            }
        }

        tracing::info!("Sync engine stopped");
    }
}

fn log_skip(outcome: SyncOutcome) {
    if let SyncOutcome::Skipped(reason) = outcome {
        tracing::debug!("Sync pass skipped: {reason:?}");
    }
}

async fn tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
