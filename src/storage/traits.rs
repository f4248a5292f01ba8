use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::coerce::SourceValue;

/// A document as stored in the document store: a string-keyed JSON mapping.
pub type Document = Map<String, Value>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Connection refused, dropped, or pool exhausted. Fatal for the current batch.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Operation '{operation}' timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },
    /// The backend answered but rejected this operation.
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Connectivity-class errors abort a batch; the rest are per-record.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// A positional query parameter. Queries are always parameterized.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

/// Rows returned by a relational source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SourceValue>>,
    /// Time spent executing and fetching, excluding connection acquisition.
    pub elapsed: Duration,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<SourceValue>>) -> Self {
        Self {
            columns,
            rows,
            elapsed: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Read-only relational source of record.
#[async_trait]
pub trait RelationalSource: Send + Sync {
    async fn execute(&self, query: &str, params: &[QueryParam]) -> Result<RowSet, StorageError>;

    /// Drop session-level state so the next query runs cold.
    async fn reset(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Outcome of a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Document selection. Field paths are dotted and walk nested objects;
/// they do not descend into arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentFilter {
    All,
    Key(String),
    FieldEq { path: String, value: Value },
}

impl DocumentFilter {
    #[must_use]
    pub fn matches(&self, key: &str, doc: &Document) -> bool {
        match self {
            Self::All => true,
            Self::Key(k) => k == key,
            Self::FieldEq { path, value } => {
                let mut parts = path.split('.');
                let mut current = parts.next().and_then(|p| doc.get(p));
                for part in parts {
                    current = current.and_then(|v| v.get(part));
                }
                current == Some(value)
            }
        }
    }
}

/// Target document store: collections of documents addressed by natural key.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_one(
        &self,
        collection: &str,
        filter: &DocumentFilter,
    ) -> Result<Option<Document>, StorageError> {
        Ok(self.find(collection, filter).await?.into_iter().next())
    }

    /// Matching documents, ordered by key.
    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
    ) -> Result<Vec<Document>, StorageError>;

    async fn exists(&self, collection: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .find_one(collection, &DocumentFilter::Key(key.to_string()))
            .await?
            .is_some())
    }

    /// Insert unless a document with `key` already exists. Must be a single
    /// conditional primitive on the backend, not check-then-insert.
    async fn insert_one(
        &self,
        collection: &str,
        key: &str,
        doc: &Document,
    ) -> Result<InsertOutcome, StorageError>;

    /// Whether [`bulk_insert`](Self::bulk_insert) commits all documents or none.
    ///
    /// When true the loader checks a whole batch first and writes the
    /// surviving records in one `bulk_insert` call.
    fn atomic_bulk_insert(&self) -> bool {
        false
    }

    /// Default implementation falls back to sequential conditional inserts.
    async fn bulk_insert(
        &self,
        collection: &str,
        docs: &[(String, Document)],
    ) -> Result<Vec<InsertOutcome>, StorageError> {
        let mut outcomes = Vec::with_capacity(docs.len());
        for (key, doc) in docs {
            outcomes.push(self.insert_one(collection, key, doc).await?);
        }
        Ok(outcomes)
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: &DocumentFilter,
    ) -> Result<u64, StorageError> {
        Ok(self.find(collection, filter).await?.len() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOrder {
    Ascending,
    Descending,
}

/// Key-value / sorted-set cache store.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn set_with_ttl(&self, key: &str, payload: &[u8], ttl_secs: u64)
        -> Result<(), StorageError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64)
        -> Result<(), StorageError>;

    /// Delete `key` and repopulate it with `members`.
    ///
    /// Default implementation is NOT atomic: readers may observe the set
    /// between the delete and the last add. Backends with transactions override it.
    async fn sorted_set_replace(
        &self,
        key: &str,
        members: &[(String, f64)],
    ) -> Result<(), StorageError> {
        self.delete(key).await?;
        for (member, score) in members {
            self.sorted_set_add(key, member, *score).await?;
        }
        Ok(())
    }

    /// Redis `ZRANGE` semantics: inclusive indices, negatives count from the end.
    async fn sorted_set_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
        order: RangeOrder,
    ) -> Result<Vec<(String, f64)>, StorageError>;

    /// Members with `min <= score <= max`, ascending.
    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StorageError>;

    async fn flush_all(&self) -> Result<(), StorageError>;

    /// Hash records whose key matches a glob `pattern` (e.g. `booking:*`).
    async fn scan_hashes(
        &self,
        pattern: &str,
    ) -> Result<Vec<(String, HashMap<String, String>)>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_key() {
        let d = doc(json!({"booking_ref": "00000F"}));
        assert!(DocumentFilter::Key("00000F".into()).matches("00000F", &d));
        assert!(!DocumentFilter::Key("000012".into()).matches("00000F", &d));
        assert!(DocumentFilter::All.matches("anything", &d));
    }

    #[test]
    fn test_filter_nested_path() {
        let d = doc(json!({"meta": {"status": "Arrived"}, "total_amount": 100.0}));
        let hit = DocumentFilter::FieldEq { path: "meta.status".into(), value: json!("Arrived") };
        let miss = DocumentFilter::FieldEq { path: "meta.gate".into(), value: json!("A1") };
        let top = DocumentFilter::FieldEq { path: "total_amount".into(), value: json!(100.0) };
        assert!(hit.matches("k", &d));
        assert!(!miss.matches("k", &d));
        assert!(top.matches("k", &d));
    }

    #[test]
    fn test_fatal_errors() {
        assert!(StorageError::Unavailable("refused".into()).is_fatal());
        assert!(StorageError::Timeout { operation: "get".into(), elapsed_ms: 10 }.is_fatal());
        assert!(!StorageError::Backend("constraint".into()).is_fatal());
    }

    #[test]
    fn test_rowset_column_index() {
        let rows = RowSet::new(vec!["a".into(), "b".into()], vec![]);
        assert_eq!(rows.column_index("b"), Some(1));
        assert_eq!(rows.column_index("c"), None);
        assert!(rows.is_empty());
    }
}
