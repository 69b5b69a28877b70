//! libSQL backend: durable `KvStore` implementation.
//!
//! Values live in a `kv` table and set membership in `set_members`, ordered
//! by an autoincrement sequence so pending sets drain oldest first.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::KvStore;

/// libSQL store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Lead store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

#[async_trait]
impl KvStore for LibSqlStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM kv WHERE key = ?1", params![key])
            .await
            .map_err(|e| StoreError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map(Some)
                .map_err(|e| StoreError::Query(format!("get row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get: {e}"))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value, now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set: {e}")))?;
        debug!(key, "Value written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let count = self
            .conn()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .await
            .map_err(|e| StoreError::Query(format!("delete: {e}")))?;
        Ok(count > 0)
    }

    async fn set_members(&self, set_key: &str) -> Result<Vec<String>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT member FROM set_members WHERE set_key = ?1 ORDER BY seq",
                params![set_key],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_members: {e}")))?;

        let mut members = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("set_members: {e}")))?
        {
            let member: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("set_members row parse: {e}")))?;
            members.push(member);
        }
        Ok(members)
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO set_members (set_key, member, added_at) VALUES (?1, ?2, ?3)",
                params![set_key, member, now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("add_to_set: {e}")))?;
        Ok(count > 0)
    }

    async fn remove_from_set(&self, set_key: &str, member: &str) -> Result<bool, StoreError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM set_members WHERE set_key = ?1 AND member = ?2",
                params![set_key, member],
            )
            .await
            .map_err(|e| StoreError::Query(format!("remove_from_set: {e}")))?;
        Ok(count > 0)
    }

    async fn set_cardinality(&self, set_key: &str) -> Result<usize, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM set_members WHERE set_key = ?1",
                params![set_key],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_cardinality: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) as usize),
            Ok(None) => Ok(0),
            Err(e) => Err(StoreError::Query(format!("set_cardinality: {e}"))),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let count = match expected {
            None => self
                .conn()
                .execute(
                    "INSERT OR IGNORE INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)",
                    params![key, new, now],
                )
                .await,
            Some(current) => self
                .conn()
                .execute(
                    "UPDATE kv SET value = ?1, updated_at = ?2 WHERE key = ?3 AND value = ?4",
                    params![new, now, key, current],
                )
                .await,
        }
        .map_err(|e| StoreError::Query(format!("compare_and_swap: {e}")))?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn values_roundtrip() {
        let store = test_store().await;
        assert!(store.get("lead:a@x.com").await.unwrap().is_none());

        store.set("lead:a@x.com", "{}").await.unwrap();
        store.set("lead:a@x.com", r#"{"v":2}"#).await.unwrap();
        assert_eq!(
            store.get("lead:a@x.com").await.unwrap().as_deref(),
            Some(r#"{"v":2}"#)
        );

        assert!(store.delete("lead:a@x.com").await.unwrap());
        assert!(!store.delete("lead:a@x.com").await.unwrap());
    }

    #[tokio::test]
    async fn sets_keep_insertion_order() {
        let store = test_store().await;
        for member in ["c@x.com", "a@x.com", "b@x.com"] {
            assert!(store.add_to_set("stage:queued", member).await.unwrap());
        }
        assert!(!store.add_to_set("stage:queued", "a@x.com").await.unwrap());

        assert_eq!(
            store.set_members("stage:queued").await.unwrap(),
            vec!["c@x.com", "a@x.com", "b@x.com"]
        );
        assert_eq!(store.set_cardinality("stage:queued").await.unwrap(), 3);
        assert_eq!(store.set_cardinality("stage:other").await.unwrap(), 0);

        assert!(store.remove_from_set("stage:queued", "a@x.com").await.unwrap());
        assert!(!store.remove_from_set("stage:queued", "a@x.com").await.unwrap());
        assert_eq!(store.set_cardinality("stage:queued").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn compare_and_swap_is_conditional() {
        let store = test_store().await;
        assert!(store.compare_and_swap("t", None, "100").await.unwrap());
        assert!(!store.compare_and_swap("t", None, "200").await.unwrap());
        assert!(!store.compare_and_swap("t", Some("150"), "200").await.unwrap());
        assert!(store.compare_and_swap("t", Some("100"), "200").await.unwrap());
        assert_eq!(store.get("t").await.unwrap().as_deref(), Some("200"));
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("campaign.db");

        {
            let store = LibSqlStore::new_local(&path).await.unwrap();
            store.set("k", "v").await.unwrap();
            store.add_to_set("s", "m").await.unwrap();
        }

        assert!(path.exists());
        let store = LibSqlStore::new_local(&path).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.set_members("s").await.unwrap(), vec!["m"]);
    }
}
