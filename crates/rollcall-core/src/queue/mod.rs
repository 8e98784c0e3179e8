//! Durable mutation queue.
//!
//! The queue keeps an in-memory mirror of the `sync_queue` collection. Every
//! mutation lands in the mirror first and is then written through to the store.
//! When the store is unreachable the write is remembered and replayed by
//! [`MutationQueue::flush`], so enqueueing never fails because of an outage.
//!
//! The mirror lock is never held across a storage await.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::error::{Error, Result};
use crate::models::{ActionKind, ChangeId, ChangeRecord, ChangeStatus};
use crate::store::{Collection, ListFilter, LocalStore, StorageBackend, StoredRecord};
use crate::tenant::TenantId;

/// Write that still has to reach the store
#[derive(Debug, Clone)]
enum PendingWrite {
    /// Persist the mirror's current copy of the entry
    Upsert,
    /// Remove the entry from the queue collection
    Delete,
    /// Move the entry to the dead-letter collection
    DeadLetter(ChangeRecord),
}

#[derive(Debug, Default)]
struct QueueState {
    entries: Vec<ChangeRecord>,
    unflushed: BTreeMap<ChangeId, (TenantId, PendingWrite)>,
}

impl QueueState {
    /// Insert keeping `(created_at, id)` order
    fn insert_ordered(&mut self, entry: ChangeRecord) {
        let at = self
            .entries
            .partition_point(|existing| (existing.created_at, existing.id) <= (entry.created_at, entry.id));
        self.entries.insert(at, entry);
    }
}

/// FIFO queue of change-records awaiting delivery
pub struct MutationQueue<B> {
    store: Arc<LocalStore<B>>,
    state: Mutex<QueueState>,
    depth: watch::Sender<usize>,
}

impl<B: StorageBackend> MutationQueue<B> {
    /// Create an empty queue over `store`; call [`restore`](Self::restore) to load persisted entries
    pub fn new(store: Arc<LocalStore<B>>) -> Self {
        Self {
            store,
            state: Mutex::new(QueueState::default()),
            depth: watch::Sender::new(0),
        }
    }

    /// Observe the number of queued changes (all tenants)
    pub fn subscribe_depth(&self) -> watch::Receiver<usize> {
        self.depth.subscribe()
    }

    /// Reload the mirror from the persisted queue, ordered by creation time.
    ///
    /// Writes still waiting for the store are flushed first, so a change
    /// dequeued during an outage is not loaded again. Entries that no longer
    /// decode are skipped with a warning.
    pub async fn restore(&self) -> Result<usize> {
        if self.has_unflushed().await {
            self.flush().await?;
        }
        let records = self.store.scan_unscoped(Collection::SyncQueue).await?;

        let mut entries: Vec<ChangeRecord> = records
            .iter()
            .filter_map(|record| match record.decode::<ChangeRecord>() {
                Ok(entry) => Some(entry),
                Err(error) => {
                    tracing::warn!("Skipping unreadable queue entry {}: {error}", record.id);
                    None
                }
            })
            .collect();
        entries.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        let count = entries.len();
        let mut state = self.state.lock().await;
        state.entries = entries;
        self.depth.send_replace(count);
        drop(state);

        tracing::info!("Restored {count} queued change(s)");
        Ok(count)
    }

    /// Append a new pending change for `tenant`.
    ///
    /// The entry is visible to the sync engine immediately, even if the store
    /// cannot be reached right now.
    pub async fn enqueue(
        &self,
        tenant: &TenantId,
        action: ActionKind,
        payload: serde_json::Value,
    ) -> Result<ChangeRecord> {
        let entry = ChangeRecord::new(tenant.clone(), action, payload);
        {
            let mut state = self.state.lock().await;
            state.entries.push(entry.clone());
            self.depth.send_replace(state.entries.len());
        }
        tracing::debug!("Queued {} change {}", entry.action, entry.id);

        self.write_through(&entry, PendingWrite::Upsert).await?;
        Ok(entry)
    }

    /// Remove an entry; unknown ids are ignored
    pub async fn dequeue(&self, id: &ChangeId) -> Result<()> {
        let removed = {
            let mut state = self.state.lock().await;
            let index = state.entries.iter().position(|entry| entry.id == *id);
            let removed = index.map(|index| state.entries.remove(index));
            self.depth.send_replace(state.entries.len());
            removed
        };

        match removed {
            Some(entry) => self.write_through(&entry, PendingWrite::Delete).await,
            None => Ok(()),
        }
    }

    /// Pending entries of `tenant` in FIFO order
    pub async fn pending_for_tenant(&self, tenant: &TenantId) -> Vec<ChangeRecord> {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .filter(|entry| entry.tenant_id == *tenant && entry.is_pending())
            .cloned()
            .collect()
    }

    /// Current mirror copy of an entry
    pub async fn get(&self, id: &ChangeId) -> Option<ChangeRecord> {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .find(|entry| entry.id == *id)
            .cloned()
    }

    /// Replace a queued entry (e.g. after bumping its retry counter)
    pub async fn update(&self, entry: &ChangeRecord) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let existing = state
                .entries
                .iter_mut()
                .find(|existing| existing.id == entry.id)
                .ok_or_else(|| Error::NotFound(format!("queued change {}", entry.id)))?;
            *existing = entry.clone();
        }

        self.write_through(entry, PendingWrite::Upsert).await
    }

    /// Take an entry out of the active queue and keep it as a failed change
    pub async fn fail(&self, mut entry: ChangeRecord) -> Result<()> {
        entry.status = ChangeStatus::Failed;
        {
            let mut state = self.state.lock().await;
            state.entries.retain(|existing| existing.id != entry.id);
            self.depth.send_replace(state.entries.len());
        }
        tracing::warn!(
            "Change {} ({}) failed permanently after {} attempt(s)",
            entry.id,
            entry.action,
            entry.retry_count
        );

        let write = PendingWrite::DeadLetter(entry.clone());
        self.write_through(&entry, write).await
    }

    /// Failed changes kept for `tenant`
    pub async fn failed_for_tenant(&self, tenant: &TenantId) -> Result<Vec<ChangeRecord>> {
        let failed: Vec<ChangeRecord> = self
            .store
            .list_as(Some(tenant), Collection::FailedChanges, &ListFilter::all())
            .await?;
        Ok(failed
            .into_iter()
            .filter(|entry| entry.tenant_id == *tenant)
            .collect())
    }

    /// Put a failed change back into the queue with a fresh retry budget
    pub async fn requeue_failed(&self, tenant: &TenantId, id: &ChangeId) -> Result<ChangeRecord> {
        let mut entry: ChangeRecord = self
            .store
            .get_as(Some(tenant), Collection::FailedChanges, &id.to_string())
            .await?
            .filter(|entry: &ChangeRecord| entry.tenant_id == *tenant)
            .ok_or_else(|| Error::NotFound(format!("failed change {id}")))?;

        entry.status = ChangeStatus::Pending;
        entry.retry_count = 0;
        entry.last_error = None;

        self.persist(&entry).await?;
        self.store
            .delete(Collection::FailedChanges, &id.to_string())
            .await?;
        {
            let mut state = self.state.lock().await;
            state.insert_ordered(entry.clone());
            self.depth.send_replace(state.entries.len());
        }

        tracing::info!("Requeued failed change {id}");
        Ok(entry)
    }

    /// Drop a failed change for good
    pub async fn discard_failed(&self, id: &ChangeId) -> Result<()> {
        self.store
            .delete(Collection::FailedChanges, &id.to_string())
            .await
    }

    /// Replay writes that could not be persisted earlier.
    ///
    /// Returns how many writes reached the store; stops at the first failure.
    pub async fn flush(&self) -> Result<usize> {
        let backlog: Vec<(ChangeId, (TenantId, PendingWrite))> = {
            let state = self.state.lock().await;
            state
                .unflushed
                .iter()
                .map(|(id, write)| (*id, write.clone()))
                .collect()
        };
        if backlog.is_empty() {
            return Ok(0);
        }

        let mut flushed = 0;
        for (id, (tenant, write)) in backlog {
            let current = self.get(&id).await;
            let result = match (&write, current) {
                (PendingWrite::Upsert, Some(entry)) => self.persist(&entry).await,
                // Dequeued or failed since; a later write supersedes this one
                (PendingWrite::Upsert, None) => Ok(()),
                (PendingWrite::Delete, _) => {
                    self.store
                        .delete(Collection::SyncQueue, &id.to_string())
                        .await
                }
                (PendingWrite::DeadLetter(entry), _) => self.dead_letter(entry).await,
            };
            result?;

            let mut state = self.state.lock().await;
            if state
                .unflushed
                .get(&id)
                .is_some_and(|(_, latest)| same_write(latest, &write))
            {
                state.unflushed.remove(&id);
            }
            drop(state);

            tracing::debug!("Flushed queued write for {id} (tenant {tenant})");
            flushed += 1;
        }

        tracing::info!("Flushed {flushed} queued write(s) to storage");
        Ok(flushed)
    }

    /// Whether some writes are still waiting for the store
    pub async fn has_unflushed(&self) -> bool {
        !self.state.lock().await.unflushed.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn len_for_tenant(&self, tenant: &TenantId) -> usize {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .filter(|entry| entry.tenant_id == *tenant)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Drop every queued change for every tenant
    pub async fn clear(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.entries.clear();
            state.unflushed.clear();
            self.depth.send_replace(0);
        }
        self.store.clear(Collection::SyncQueue).await
    }

    /// Apply `write` now, or remember it when the store is unavailable
    async fn write_through(&self, entry: &ChangeRecord, write: PendingWrite) -> Result<()> {
        let result = match &write {
            PendingWrite::Upsert => self.persist(entry).await,
            PendingWrite::Delete => {
                self.store
                    .delete(Collection::SyncQueue, &entry.id.to_string())
                    .await
            }
            PendingWrite::DeadLetter(failed) => self.dead_letter(failed).await,
        };

        match result {
            Ok(()) => {
                self.state.lock().await.unflushed.remove(&entry.id);
                Ok(())
            }
            Err(Error::StorageUnavailable(reason)) => {
                tracing::warn!("Storage unavailable, keeping change {} in memory: {reason}", entry.id);
                self.state
                    .lock()
                    .await
                    .unflushed
                    .insert(entry.id, (entry.tenant_id.clone(), write));
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn persist(&self, entry: &ChangeRecord) -> Result<()> {
        let record = StoredRecord::from_value(entry.id.to_string(), entry)?
            .with_tenant(entry.tenant_id.clone());
        self.store
            .put(&entry.tenant_id, Collection::SyncQueue, record)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, entry: &ChangeRecord) -> Result<()> {
        let record = StoredRecord::from_value(entry.id.to_string(), entry)?
            .with_tenant(entry.tenant_id.clone());
        self.store
            .put(&entry.tenant_id, Collection::FailedChanges, record)
            .await?;
        self.store
            .delete(Collection::SyncQueue, &entry.id.to_string())
            .await
    }
}

fn same_write(a: &PendingWrite, b: &PendingWrite) -> bool {
    matches!(
        (a, b),
        (PendingWrite::Upsert, PendingWrite::Upsert)
            | (PendingWrite::Delete, PendingWrite::Delete)
            | (PendingWrite::DeadLetter(_), PendingWrite::DeadLetter(_))
    )
}
