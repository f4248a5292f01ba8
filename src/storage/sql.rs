// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL-backed document store.
//!
//! One table holds every collection; bodies are JSON text:
//!
//! ```sql
//! CREATE TABLE documents (
//!   collection VARCHAR(64)  NOT NULL,
//!   doc_key    VARCHAR(255) NOT NULL,
//!   body       LONGTEXT     NOT NULL,   -- JSON as text
//!   PRIMARY KEY (collection, doc_key)
//! )
//! ```
//!
//! Conditional insert is a single statement per dialect, so concurrent
//! loaders cannot both insert the same key:
//!
//! | Dialect | Statement |
//! |---|---|
//! | SQLite, Postgres | `INSERT ... ON CONFLICT (collection, doc_key) DO NOTHING` |
//! | MySQL | `INSERT IGNORE ...` |
//!
//! `rows_affected() == 0` means the key was already there.
//!
//! ## sqlx Any Driver Quirks
//!
//! Bodies are TEXT rather than a native JSON type because the `Any` driver
//! does not map MySQL's JSON type, and it reads LONGTEXT as bytes (so reads
//! try `String` first, then `Vec<u8>`). Statements are written with `?` and
//! rewritten to `$n` for Postgres.
//!
//! Field filters ([`DocumentFilter::FieldEq`]) are evaluated after the read;
//! only the collection and key narrow the SQL.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tracing::debug;

use super::traits::{Document, DocumentFilter, DocumentStore, InsertOutcome, StorageError};
use crate::resilience::retry::{retry_when, RetryConfig};
use crate::metrics::LatencyTimer;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Connectivity problems are `Unavailable`; everything else is a per-call rejection.
pub(crate) fn classify_sqlx_error(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StorageError::Unavailable(e.to_string()),
        _ => StorageError::Backend(e.to_string()),
    }
}

fn is_transient(e: &StorageError) -> bool {
    e.is_fatal()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Sqlite,
    MySql,
    Postgres,
}

impl Dialect {
    fn from_url(url: &str) -> Result<Self, StorageError> {
        if url.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else if url.starts_with("mysql:") || url.starts_with("mariadb:") {
            Ok(Self::MySql)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Ok(Self::Postgres)
        } else {
            Err(StorageError::Backend(format!("unsupported document store url: {url}")))
        }
    }

    /// Rewrite `?` placeholders for the dialect.
    fn sql(self, template: &str) -> String {
        if self != Self::Postgres {
            return template.to_string();
        }
        let mut out = String::with_capacity(template.len() + 8);
        let mut n = 0;
        for c in template.chars() {
            if c == '?' {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            } else {
                out.push(c);
            }
        }
        out
    }

    fn create_table(self) -> &'static str {
        match self {
            Self::Sqlite | Self::Postgres => {
                r"CREATE TABLE IF NOT EXISTS documents (
                    collection TEXT NOT NULL,
                    doc_key TEXT NOT NULL,
                    body TEXT NOT NULL,
                    PRIMARY KEY (collection, doc_key)
                )"
            }
            Self::MySql => {
                r"CREATE TABLE IF NOT EXISTS documents (
                    collection VARCHAR(64) NOT NULL,
                    doc_key VARCHAR(255) NOT NULL,
                    body LONGTEXT NOT NULL,
                    PRIMARY KEY (collection, doc_key)
                )"
            }
        }
    }

    fn insert_if_absent(self) -> &'static str {
        match self {
            Self::Sqlite | Self::Postgres => {
                "INSERT INTO documents (collection, doc_key, body) VALUES (?, ?, ?) \
                 ON CONFLICT (collection, doc_key) DO NOTHING"
            }
            Self::MySql => "INSERT IGNORE INTO documents (collection, doc_key, body) VALUES (?, ?, ?)",
        }
    }
}

pub struct SqlDocumentStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlDocumentStore {
    /// Connect with startup-mode retry and create the table if needed.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();
        let dialect = Dialect::from_url(connection_string)?;

        // Each in-memory SQLite connection is its own database.
        let max_connections = if connection_string.contains(":memory:") { 1 } else { 20 };

        let pool = retry_when("sql_connect", &RetryConfig::startup(), is_transient, || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(classify_sqlx_error)
        })
        .await?;

        let store = Self { pool, dialect };
        if dialect == Dialect::Sqlite {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;
        Ok(store)
    }

    #[must_use]
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {e}")))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = self.dialect.create_table();
        retry_when("sql_init_schema", &RetryConfig::startup(), is_transient, || async {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(classify_sqlx_error)
        })
        .await?;
        Ok(())
    }

    fn decode_body(row: &sqlx::any::AnyRow) -> Result<Document, StorageError> {
        // SQLite/Postgres TEXT reads as String, MySQL LONGTEXT as bytes
        let text = row
            .try_get::<String, _>("body")
            .ok()
            .or_else(|| {
                row.try_get::<Vec<u8>, _>("body")
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            })
            .ok_or_else(|| StorageError::Serialization("unreadable body column".into()))?;

        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(doc)) => Ok(doc),
            Ok(_) => Err(StorageError::Serialization("stored body is not a mapping".into())),
            Err(e) => Err(StorageError::Serialization(e.to_string())),
        }
    }

    fn read_key(row: &sqlx::any::AnyRow) -> Result<String, StorageError> {
        row.try_get::<String, _>("doc_key")
            .ok()
            .or_else(|| {
                row.try_get::<Vec<u8>, _>("doc_key")
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            })
            .ok_or_else(|| StorageError::Serialization("unreadable doc_key column".into()))
    }
}

#[async_trait]
impl DocumentStore for SqlDocumentStore {
    async fn find(&self, collection: &str, filter: &DocumentFilter) -> Result<Vec<Document>, StorageError> {
        let _timer = LatencyTimer::new("sql", "find");
        let key = match filter {
            DocumentFilter::Key(k) => Some(k.as_str()),
            _ => None,
        };
        let sql = match key {
            Some(_) => self.dialect.sql(
                "SELECT doc_key, body FROM documents WHERE collection = ? AND doc_key = ? ORDER BY doc_key",
            ),
            None => self
                .dialect
                .sql("SELECT doc_key, body FROM documents WHERE collection = ? ORDER BY doc_key"),
        };

        let rows = retry_when("sql_find", &RetryConfig::query(), is_transient, || async {
            let mut query = sqlx::query(&sql).bind(collection);
            if let Some(k) = key {
                query = query.bind(k);
            }
            query.fetch_all(&self.pool).await.map_err(classify_sqlx_error)
        })
        .await?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in &rows {
            let doc_key = Self::read_key(row)?;
            let doc = Self::decode_body(row)?;
            if filter.matches(&doc_key, &doc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    async fn exists(&self, collection: &str, key: &str) -> Result<bool, StorageError> {
        let sql = self
            .dialect
            .sql("SELECT 1 FROM documents WHERE collection = ? AND doc_key = ? LIMIT 1");
        retry_when("sql_exists", &RetryConfig::query(), is_transient, || async {
            let found = sqlx::query(&sql)
                .bind(collection)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(classify_sqlx_error)?;
            Ok(found.is_some())
        })
        .await
    }

    /// If a retry follows a lost acknowledgement of a committed write, the
    /// retry sees the row and reports `AlreadyPresent`. The loader then counts
    /// a duplicate for a record this call actually inserted.
    async fn insert_one(&self, collection: &str, key: &str, doc: &Document) -> Result<InsertOutcome, StorageError> {
        let _timer = LatencyTimer::new("sql", "insert_one");
        let body = serde_json::to_string(doc).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let sql = self.dialect.sql(self.dialect.insert_if_absent());

        // Re-running a conditional insert is safe, so transient failures retry.
        let affected = retry_when("sql_insert", &RetryConfig::query(), is_transient, || async {
            sqlx::query(&sql)
                .bind(collection)
                .bind(key)
                .bind(&body)
                .execute(&self.pool)
                .await
                .map(|r| r.rows_affected())
                .map_err(classify_sqlx_error)
        })
        .await?;

        Ok(if affected > 0 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyPresent
        })
    }

    fn atomic_bulk_insert(&self) -> bool {
        true
    }

    /// All inserts share one transaction; a failure rolls the whole set back.
    async fn bulk_insert(&self, collection: &str, docs: &[(String, Document)]) -> Result<Vec<InsertOutcome>, StorageError> {
        let _timer = LatencyTimer::new("sql", "bulk_insert");
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let sql = self.dialect.sql(self.dialect.insert_if_absent());
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;
        let mut outcomes = Vec::with_capacity(docs.len());

        for (key, doc) in docs {
            let body = serde_json::to_string(doc).map_err(|e| StorageError::Serialization(e.to_string()))?;
            let affected = sqlx::query(&sql)
                .bind(collection)
                .bind(key.as_str())
                .bind(body)
                .execute(&mut *tx)
                .await
                .map_err(classify_sqlx_error)?
                .rows_affected();
            outcomes.push(if affected > 0 {
                InsertOutcome::Inserted
            } else {
                InsertOutcome::AlreadyPresent
            });
        }

        tx.commit().await.map_err(classify_sqlx_error)?;
        debug!(collection, documents = docs.len(), "Bulk insert committed");
        Ok(outcomes)
    }

    async fn count_documents(&self, collection: &str, filter: &DocumentFilter) -> Result<u64, StorageError> {
        if !matches!(filter, DocumentFilter::All) {
            return Ok(self.find(collection, filter).await?.len() as u64);
        }
        let sql = self
            .dialect
            .sql("SELECT COUNT(*) AS n FROM documents WHERE collection = ?");
        retry_when("sql_count", &RetryConfig::query(), is_transient, || async {
            let row = sqlx::query(&sql)
                .bind(collection)
                .fetch_one(&self.pool)
                .await
                .map_err(classify_sqlx_error)?;
            let n: i64 = row.try_get("n").map_err(classify_sqlx_error)?;
            Ok(n.max(0) as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::load::{EntityKind, IdempotentLoader};
    use crate::model::BookingRecord;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cross_store_sync_{}_{}.db", name, std::process::id()))
    }

    /// Clean up SQLite database and its WAL files
    fn cleanup_db(path: &PathBuf) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(format!("{}-wal", path.display()));
        let _ = std::fs::remove_file(format!("{}-shm", path.display()));
    }

    async fn open(name: &str) -> (SqlDocumentStore, PathBuf) {
        let path = temp_db_path(name);
        cleanup_db(&path);
        let url = format!("sqlite://{}?mode=rwc", path.display());
        (SqlDocumentStore::new(&url).await.unwrap(), path)
    }

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_postgres_placeholders() {
        let sql = Dialect::Postgres.sql("SELECT 1 FROM documents WHERE collection = ? AND doc_key = ?");
        assert_eq!(sql, "SELECT 1 FROM documents WHERE collection = $1 AND doc_key = $2");
        assert_eq!(Dialect::Sqlite.sql("a = ?"), "a = ?");
        assert!(Dialect::MySql.insert_if_absent().starts_with("INSERT IGNORE"));
        assert!(Dialect::from_url("mongodb://x").is_err());
    }

    #[tokio::test]
    async fn test_conditional_insert_and_exists() {
        let (store, path) = open("conditional").await;
        let d = doc(json!({"booking_ref": "00000F", "total_amount": 265700.0}));

        assert_eq!(store.insert_one("bookings", "00000F", &d).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_one("bookings", "00000F", &d).await.unwrap(), InsertOutcome::AlreadyPresent);
        assert!(store.exists("bookings", "00000F").await.unwrap());
        assert!(!store.exists("tickets", "00000F").await.unwrap());

        let found = store
            .find_one("bookings", &DocumentFilter::Key("00000F".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["total_amount"], json!(265700.0));

        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_find_filters_nested_fields() {
        let (store, path) = open("find").await;
        for (k, status) in [("B", "Arrived"), ("A", "Scheduled"), ("C", "Arrived")] {
            store
                .insert_one("bookings", k, &doc(json!({"meta": {"status": status}})))
                .await
                .unwrap();
        }

        let filter = DocumentFilter::FieldEq { path: "meta.status".into(), value: json!("Arrived") };
        assert_eq!(store.find("bookings", &filter).await.unwrap().len(), 2);
        assert_eq!(store.count_documents("bookings", &filter).await.unwrap(), 2);
        assert_eq!(store.count_documents("bookings", &DocumentFilter::All).await.unwrap(), 3);

        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_bulk_insert_reports_each_outcome() {
        let (store, path) = open("bulk").await;
        store.insert_one("tickets", "T2", &doc(json!({}))).await.unwrap();

        let batch: Vec<(String, Document)> = ["T1", "T2", "T3"]
            .iter()
            .map(|k| (k.to_string(), doc(json!({"ticket_no": k}))))
            .collect();
        let outcomes = store.bulk_insert("tickets", &batch).await.unwrap();
        assert_eq!(
            outcomes,
            vec![InsertOutcome::Inserted, InsertOutcome::AlreadyPresent, InsertOutcome::Inserted]
        );
        assert_eq!(store.count_documents("tickets", &DocumentFilter::All).await.unwrap(), 3);

        cleanup_db(&path);
    }

    fn booking(r: &str) -> BookingRecord {
        BookingRecord {
            book_ref: r.into(),
            book_date: NaiveDate::from_ymd_opt(2017, 7, 5).unwrap(),
            total_amount: 1000.0,
        }
    }

    #[tokio::test]
    async fn test_loader_writes_checked_batch_in_one_transaction() {
        let (store, path) = open("loader_batch").await;
        let store = Arc::new(store);
        store.insert_one("bookings", "B00002", &doc(json!({}))).await.unwrap();

        let loader = IdempotentLoader::new(Arc::clone(&store), &SyncConfig::default());
        let summary = loader
            .load_batch(vec![booking("B00001"), booking("B00002"), booking("B00003"), booking("B00001")])
            .await
            .unwrap();

        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.skipped_duplicate, 2);
        assert_eq!(store.count_documents("bookings", &DocumentFilter::All).await.unwrap(), 3);

        cleanup_db(&path);
    }

    /// Delegates to SQLite but loses the connection when checking one key.
    struct DroppingStore {
        inner: SqlDocumentStore,
        lost_key: &'static str,
    }

    #[async_trait]
    impl DocumentStore for DroppingStore {
        async fn find(&self, collection: &str, filter: &DocumentFilter) -> Result<Vec<Document>, StorageError> {
            self.inner.find(collection, filter).await
        }

        async fn exists(&self, collection: &str, key: &str) -> Result<bool, StorageError> {
            if key == self.lost_key {
                return Err(StorageError::Unavailable("connection reset".into()));
            }
            self.inner.exists(collection, key).await
        }

        async fn insert_one(&self, collection: &str, key: &str, doc: &Document) -> Result<InsertOutcome, StorageError> {
            self.inner.insert_one(collection, key, doc).await
        }

        fn atomic_bulk_insert(&self) -> bool {
            self.inner.atomic_bulk_insert()
        }

        async fn bulk_insert(&self, collection: &str, docs: &[(String, Document)]) -> Result<Vec<InsertOutcome>, StorageError> {
            self.inner.bulk_insert(collection, docs).await
        }
    }

    #[tokio::test]
    async fn test_aborted_load_commits_nothing() {
        let (inner, path) = open("loader_abort").await;
        let store = Arc::new(DroppingStore { inner, lost_key: "B00003" });

        let loader = IdempotentLoader::new(Arc::clone(&store), &SyncConfig::default()).with_concurrency(1);
        let err = loader
            .load_batch(vec![booking("B00001"), booking("B00002"), booking("B00003"), booking("B00004")])
            .await
            .unwrap_err();

        let bookings = err.partial_summary().unwrap().entity(EntityKind::Booking).unwrap().clone();
        assert!(bookings.aborted.is_some());
        assert_eq!(bookings.inserted, 0);
        assert_eq!(store.count_documents("bookings", &DocumentFilter::All).await.unwrap(), 0);

        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_in_memory_sqlite() {
        let store = SqlDocumentStore::new("sqlite::memory:").await.unwrap();
        store.insert_one("flights", "1", &doc(json!({"flight_id": 1}))).await.unwrap();
        assert!(store.exists("flights", "1").await.unwrap());
    }
}
