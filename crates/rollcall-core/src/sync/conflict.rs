//! Last-write-wins conflict resolution

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{AttendanceRecord, ConflictWinner, SessionRecord, SyncConflict};
use crate::store::{AttendanceRepository, Collection, ListFilter, LocalStore, StorageBackend};
use crate::tenant::TenantId;

const LWW_STRATEGY: &str = "lww";

/// Records carrying the domain timestamp used for ordering writes
pub trait Timestamped {
    fn domain_timestamp(&self) -> DateTime<Utc>;
}

impl Timestamped for AttendanceRecord {
    fn domain_timestamp(&self) -> DateTime<Utc> {
        self.marked_at
    }
}

impl Timestamped for SessionRecord {
    fn domain_timestamp(&self) -> DateTime<Utc> {
        self.saved_at
    }
}

/// Side that wins: local only when strictly newer, ties go to the remote copy
pub fn conflict_winner<T: Timestamped>(local: &T, remote: &T) -> ConflictWinner {
    if local.domain_timestamp() > remote.domain_timestamp() {
        ConflictWinner::Local
    } else {
        ConflictWinner::Remote
    }
}

/// Last-write-wins: keep the copy [`conflict_winner`] picks
pub fn resolve_conflict<T: Timestamped>(local: T, remote: T) -> T {
    match conflict_winner(&local, &remote) {
        ConflictWinner::Local => local,
        ConflictWinner::Remote => remote,
    }
}

/// What reconciling a remote record did to the local copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// No local copy existed; the remote record was stored
    Inserted,
    /// Both sides agree
    Unchanged,
    /// Both sides differed; the conflict was logged
    Resolved(ConflictWinner),
}

/// Merge a remote attendance record into the local store
pub async fn reconcile_attendance<B: StorageBackend>(
    store: &LocalStore<B>,
    tenant: &TenantId,
    mut remote: AttendanceRecord,
) -> Result<Reconciliation> {
    let repo = AttendanceRepository::new(store);
    remote.synced = true;
    remote.synced_at = Some(Utc::now());

    let Some(local) = repo.get_record(Some(tenant), &remote.id).await? else {
        repo.save_record(tenant, &remote).await?;
        return Ok(Reconciliation::Inserted);
    };

    if local.status == remote.status && local.remarks == remote.remarks {
        return Ok(Reconciliation::Unchanged);
    }

    let winner = conflict_winner(&local, &remote);
    if winner == ConflictWinner::Remote {
        repo.save_record(tenant, &remote).await?;
    }

    let conflict = SyncConflict {
        record_id: remote.id.clone(),
        collection: Collection::AttendanceRecords.to_string(),
        local_timestamp: local.marked_at,
        remote_timestamp: remote.marked_at,
        winner,
        resolved_at: Utc::now(),
        strategy: LWW_STRATEGY.to_string(),
    };
    store
        .put_value(tenant, Collection::SyncConflicts, String::new(), &conflict)
        .await?;

    tracing::info!(
        "Resolved conflict on {} in favor of {winner:?} copy",
        conflict.record_id
    );
    Ok(Reconciliation::Resolved(winner))
}

/// Most recently logged conflicts for `tenant`, newest first
pub async fn list_conflicts<B: StorageBackend>(
    store: &LocalStore<B>,
    tenant: &TenantId,
    limit: usize,
) -> Result<Vec<SyncConflict>> {
    let mut conflicts: Vec<SyncConflict> = store
        .list_as(Some(tenant), Collection::SyncConflicts, &ListFilter::all())
        .await?;
    conflicts.sort_by(|a, b| b.resolved_at.cmp(&a.resolved_at));
    conflicts.truncate(limit);
    Ok(conflicts)
}
