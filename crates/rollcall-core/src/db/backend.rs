//! Durable storage backend over libSQL

use std::path::Path;

use libsql::{params, Value};
use tokio::sync::Mutex;

use super::Database;
use crate::error::{Error, Result};
use crate::store::{Collection, StorageBackend, StoredRecord};
use crate::tenant::TenantId;

/// [`StorageBackend`] persisting every collection in a single `records` table
pub struct LibSqlBackend {
    db: Mutex<Database>,
}

impl LibSqlBackend {
    /// Open (or create) the store file at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_database(Database::open(path).await?))
    }

    /// Open an in-memory store (primarily for tests)
    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory().await?))
    }

    pub fn from_database(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    fn parse_record(row: &libsql::Row) -> Result<StoredRecord> {
        let tenant_id = match row.get_value(1)? {
            Value::Text(tenant) => Some(tenant.parse::<TenantId>()?),
            Value::Null => None,
            other => {
                return Err(Error::StorageUnavailable(format!(
                    "unexpected tenant column value: {other:?}"
                )))
            }
        };
        let body: String = row.get(3)?;

        Ok(StoredRecord {
            id: row.get(0)?,
            tenant_id,
            updated_at: row.get(2)?,
            body: serde_json::from_str(&body)?,
        })
    }
}

impl StorageBackend for LibSqlBackend {
    async fn upsert(&self, collection: Collection, record: &StoredRecord) -> Result<()> {
        let tenant = record
            .tenant_id
            .as_ref()
            .map_or(Value::Null, |tenant| Value::Text(tenant.as_str().to_string()));
        let body = serde_json::to_string(&record.body)?;

        let db = self.db.lock().await;
        db.connection()
            .execute(
                "INSERT INTO records (collection, id, tenant_id, updated_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(collection, id) DO UPDATE SET
                    tenant_id = excluded.tenant_id,
                    updated_at = excluded.updated_at,
                    body = excluded.body",
                params![
                    collection.as_str(),
                    record.id.as_str(),
                    tenant,
                    record.updated_at,
                    body
                ],
            )
            .await?;
        Ok(())
    }

    async fn fetch(&self, collection: Collection, id: &str) -> Result<Option<StoredRecord>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT id, tenant_id, updated_at, body FROM records
                 WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn scan(&self, collection: Collection) -> Result<Vec<StoredRecord>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT id, tenant_id, updated_at, body FROM records
                 WHERE collection = ?1 ORDER BY seq",
                params![collection.as_str()],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(&row)?);
        }
        Ok(records)
    }

    async fn remove(&self, collection: Collection, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.connection()
            .execute(
                "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id],
            )
            .await?;
        Ok(())
    }

    async fn truncate(&self, collection: Collection) -> Result<()> {
        let db = self.db.lock().await;
        db.connection()
            .execute(
                "DELETE FROM records WHERE collection = ?1",
                params![collection.as_str()],
            )
            .await?;
        Ok(())
    }
}
