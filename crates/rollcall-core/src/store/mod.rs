//! Tenant-partitioned local store.
//!
//! Records live in named collections behind a [`StorageBackend`]. Every record
//! carries an optional tenant tag; [`LocalStore`] stamps the tag on write and
//! filters on read so a tenant only sees its own data (plus untagged legacy
//! records under [`TenantVisibility::Lenient`]).

mod memory;
mod repository;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tenant::TenantId;
use crate::util::unix_millis_now;

pub use memory::MemoryBackend;
pub use repository::AttendanceRepository;

/// Named partition of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    AppSettings,
    SyncQueue,
    FailedChanges,
    SyncConflicts,
    AttendanceSessions,
    AttendanceRecords,
    Exceptions,
    Classes,
    Students,
    Teachers,
    Subjects,
    Terms,
}

impl Collection {
    pub const ALL: [Self; 12] = [
        Self::AppSettings,
        Self::SyncQueue,
        Self::FailedChanges,
        Self::SyncConflicts,
        Self::AttendanceSessions,
        Self::AttendanceRecords,
        Self::Exceptions,
        Self::Classes,
        Self::Students,
        Self::Teachers,
        Self::Subjects,
        Self::Terms,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AppSettings => "app_settings",
            Self::SyncQueue => "sync_queue",
            Self::FailedChanges => "failed_changes",
            Self::SyncConflicts => "sync_conflicts",
            Self::AttendanceSessions => "attendance_sessions",
            Self::AttendanceRecords => "attendance_records",
            Self::Exceptions => "exceptions",
            Self::Classes => "classes",
            Self::Students => "students",
            Self::Teachers => "teachers",
            Self::Subjects => "subjects",
            Self::Terms => "terms",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|collection| collection.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown collection: {s}")))
    }
}

/// Whether untagged records are visible to every tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TenantVisibility {
    /// Untagged (pre-migration) records pass through for every tenant
    #[default]
    Lenient,
    /// Only records tagged with the active tenant are visible
    Strict,
}

/// Stored document plus the metadata the store maintains for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    /// Owning tenant; `None` for legacy data written before tagging
    pub tenant_id: Option<TenantId>,
    /// Last write (Unix ms)
    pub updated_at: i64,
    pub body: serde_json::Value,
}

impl StoredRecord {
    /// Wrap a JSON body; an empty id is replaced on `put`
    pub fn new(id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            tenant_id: None,
            updated_at: 0,
            body,
        }
    }

    /// Serialize a domain value into a record
    pub fn from_value<T: Serialize>(id: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(id, serde_json::to_value(value)?))
    }

    /// Tag the record with an explicit tenant
    #[must_use]
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant_id = Some(tenant);
        self
    }

    /// Deserialize the body into a domain value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Secondary-key filter applied to top-level body fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListFilter {
    fields: Vec<(String, serde_json::Value)>,
    limit: Option<usize>,
}

impl ListFilter {
    /// Match every record
    pub fn all() -> Self {
        Self::default()
    }

    /// Require `body[field] == value`
    #[must_use]
    pub fn field_eq(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.push((field.into(), value.into()));
        self
    }

    /// Keep at most `limit` records (in insertion order)
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, record: &StoredRecord) -> bool {
        self.fields
            .iter()
            .all(|(field, expected)| record.body.get(field) == Some(expected))
    }
}

/// Raw, unfiltered collection storage.
///
/// Implementations keep insertion order within a collection; overwriting an
/// existing id keeps its position. Unreachable storage is reported as
/// [`Error::StorageUnavailable`].
#[allow(async_fn_in_trait)]
pub trait StorageBackend {
    /// Insert or overwrite by `(collection, record.id)`
    async fn upsert(&self, collection: Collection, record: &StoredRecord) -> Result<()>;

    /// Fetch one record by id
    async fn fetch(&self, collection: Collection, id: &str) -> Result<Option<StoredRecord>>;

    /// All records of a collection in insertion order
    async fn scan(&self, collection: Collection) -> Result<Vec<StoredRecord>>;

    /// Remove by id; absent ids are not an error
    async fn remove(&self, collection: Collection, id: &str) -> Result<()>;

    /// Remove every record of a collection
    async fn truncate(&self, collection: Collection) -> Result<()>;
}

impl<B: StorageBackend> StorageBackend for Arc<B> {
    async fn upsert(&self, collection: Collection, record: &StoredRecord) -> Result<()> {
        (**self).upsert(collection, record).await
    }

    async fn fetch(&self, collection: Collection, id: &str) -> Result<Option<StoredRecord>> {
        (**self).fetch(collection, id).await
    }

    async fn scan(&self, collection: Collection) -> Result<Vec<StoredRecord>> {
        (**self).scan(collection).await
    }

    async fn remove(&self, collection: Collection, id: &str) -> Result<()> {
        (**self).remove(collection, id).await
    }

    async fn truncate(&self, collection: Collection) -> Result<()> {
        (**self).truncate(collection).await
    }
}

/// Tenant-aware facade over a storage backend
#[derive(Debug)]
pub struct LocalStore<B> {
    backend: B,
    visibility: TenantVisibility,
}

impl<B: StorageBackend> LocalStore<B> {
    /// Create a store with lenient visibility of untagged records
    pub const fn new(backend: B) -> Self {
        Self {
            backend,
            visibility: TenantVisibility::Lenient,
        }
    }

    #[must_use]
    pub const fn with_visibility(mut self, visibility: TenantVisibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub const fn visibility(&self) -> TenantVisibility {
        self.visibility
    }

    /// Get a reference to the underlying backend
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Insert or overwrite a record and return its id.
    ///
    /// Records without a tenant tag are stamped with `tenant`; an existing tag
    /// is preserved. An empty id is replaced with a generated one.
    pub async fn put(
        &self,
        tenant: &TenantId,
        collection: Collection,
        mut record: StoredRecord,
    ) -> Result<String> {
        if record.id.trim().is_empty() {
            record.id = uuid::Uuid::now_v7().to_string();
        }
        if record.tenant_id.is_none() {
            record.tenant_id = Some(tenant.clone());
        }
        record.updated_at = unix_millis_now();

        self.backend.upsert(collection, &record).await?;
        Ok(record.id)
    }

    /// Serialize and store a domain value under `id`
    pub async fn put_value<T: Serialize>(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: impl Into<String>,
        value: &T,
    ) -> Result<String> {
        self.put(tenant, collection, StoredRecord::from_value(id, value)?)
            .await
    }

    /// Fetch a record visible to `tenant`
    pub async fn get(
        &self,
        tenant: Option<&TenantId>,
        collection: Collection,
        id: &str,
    ) -> Result<Option<StoredRecord>> {
        let Some(tenant) = tenant else {
            return Ok(None);
        };
        let record = self.backend.fetch(collection, id).await?;
        Ok(record.filter(|record| self.is_visible(record, tenant)))
    }

    /// Fetch and decode a record visible to `tenant`
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        tenant: Option<&TenantId>,
        collection: Collection,
        id: &str,
    ) -> Result<Option<T>> {
        self.get(tenant, collection, id)
            .await?
            .map(|record| record.decode())
            .transpose()
    }

    /// List records visible to `tenant` that match `filter`
    pub async fn list(
        &self,
        tenant: Option<&TenantId>,
        collection: Collection,
        filter: &ListFilter,
    ) -> Result<Vec<StoredRecord>> {
        let Some(tenant) = tenant else {
            tracing::debug!("No active tenant; listing {collection} returns nothing");
            return Ok(Vec::new());
        };

        let records = self
            .backend
            .scan(collection)
            .await?
            .into_iter()
            .filter(|record| self.is_visible(record, tenant) && filter.matches(record));

        Ok(match filter.limit {
            Some(limit) => records.take(limit).collect(),
            None => records.collect(),
        })
    }

    /// List and decode records visible to `tenant`
    pub async fn list_as<T: DeserializeOwned>(
        &self,
        tenant: Option<&TenantId>,
        collection: Collection,
        filter: &ListFilter,
    ) -> Result<Vec<T>> {
        self.list(tenant, collection, filter)
            .await?
            .iter()
            .map(StoredRecord::decode)
            .collect()
    }

    /// Remove a record; absent ids are not an error
    pub async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        self.backend.remove(collection, id).await
    }

    /// Empty a collection for every tenant
    pub async fn clear(&self, collection: Collection) -> Result<()> {
        self.backend.truncate(collection).await
    }

    /// Remove only the records tagged with `tenant`; returns how many were removed
    pub async fn clear_for_tenant(&self, tenant: &TenantId, collection: Collection) -> Result<usize> {
        let owned: Vec<StoredRecord> = self
            .backend
            .scan(collection)
            .await?
            .into_iter()
            .filter(|record| record.tenant_id.as_ref() == Some(tenant))
            .collect();

        for record in &owned {
            self.backend.remove(collection, &record.id).await?;
        }
        tracing::info!(
            "Cleared {} record(s) of tenant {tenant} from {collection}",
            owned.len()
        );
        Ok(owned.len())
    }

    /// Serialized size of every record visible to `tenant`
    pub async fn usage_bytes(&self, tenant: Option<&TenantId>) -> Result<usize> {
        let mut total = 0;
        for collection in Collection::ALL {
            for record in self.list(tenant, collection, &ListFilter::all()).await? {
                total += serde_json::to_vec(&record.body)?.len();
            }
        }
        Ok(total)
    }

    /// Every record of a collection regardless of tenant (queue restore only)
    pub(crate) async fn scan_unscoped(&self, collection: Collection) -> Result<Vec<StoredRecord>> {
        self.backend.scan(collection).await
    }

    fn is_visible(&self, record: &StoredRecord, tenant: &TenantId) -> bool {
        match &record.tenant_id {
            Some(owner) => owner == tenant,
            None => self.visibility == TenantVisibility::Lenient,
        }
    }
}
