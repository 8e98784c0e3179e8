//! In-memory storage backend

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{Collection, StorageBackend, StoredRecord};
use crate::error::{Error, Result};

/// Volatile backend for tests and ephemeral sessions.
///
/// `set_available(false)` makes every call fail with
/// [`Error::StorageUnavailable`], which is how outages are simulated.
#[derive(Debug)]
pub struct MemoryBackend {
    collections: Mutex<HashMap<Collection, Vec<StoredRecord>>>,
    available: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated availability
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn collections(&self) -> Result<MutexGuard<'_, HashMap<Collection, Vec<StoredRecord>>>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::StorageUnavailable(
                "memory backend is offline".to_string(),
            ));
        }
        self.collections
            .lock()
            .map_err(|_| Error::StorageUnavailable("memory backend lock poisoned".to_string()))
    }
}

impl StorageBackend for MemoryBackend {
    async fn upsert(&self, collection: Collection, record: &StoredRecord) -> Result<()> {
        let mut collections = self.collections()?;
        let records = collections.entry(collection).or_default();
        match records.iter_mut().find(|existing| existing.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }

    async fn fetch(&self, collection: Collection, id: &str) -> Result<Option<StoredRecord>> {
        let collections = self.collections()?;
        Ok(collections
            .get(&collection)
            .and_then(|records| records.iter().find(|record| record.id == id))
            .cloned())
    }

    async fn scan(&self, collection: Collection) -> Result<Vec<StoredRecord>> {
        let collections = self.collections()?;
        Ok(collections.get(&collection).cloned().unwrap_or_default())
    }

    async fn remove(&self, collection: Collection, id: &str) -> Result<()> {
        let mut collections = self.collections()?;
        if let Some(records) = collections.get_mut(&collection) {
            records.retain(|record| record.id != id);
        }
        Ok(())
    }

    async fn truncate(&self, collection: Collection) -> Result<()> {
        let mut collections = self.collections()?;
        collections.remove(&collection);
        Ok(())
    }
}
