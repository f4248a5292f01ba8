// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Extraction from the relational source (and hash records from the cache).
//!
//! Queries are always parameterized; nothing here formats user data into SQL.
//! The reported duration is the source's own execute-and-fetch time, so pool
//! waits and connection setup never leak into benchmark numbers.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::metrics;
use crate::resilience::timeout::with_timeout;
use crate::storage::traits::{CacheStore, QueryParam, RelationalSource, RowSet};

/// Rows, column names, and the measured execute-and-fetch time.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub rows: RowSet,
    pub duration: Duration,
}

impl Extraction {
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.rows.columns
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

/// Run one parameterized query. Any failure is fatal for the call; no
/// partial row set is returned.
pub async fn extract<S: RelationalSource + ?Sized>(
    source: &S,
    name: &str,
    query: &str,
    params: &[QueryParam],
    timeout: Duration,
) -> Result<Extraction, PipelineError> {
    match with_timeout("source_execute", timeout, source.execute(query, params)).await {
        Ok(rows) => {
            let duration = rows.elapsed;
            debug!(query = name, rows = rows.len(), duration_ms = duration.as_millis() as u64, "Extracted");
            metrics::record_extraction(name, rows.len(), duration);
            Ok(Extraction { rows, duration })
        }
        Err(e) => {
            warn!(query = name, error = %e, "Extraction failed");
            metrics::record_extraction_failure(name);
            Err(PipelineError::source(e))
        }
    }
}

/// One hash record from the cache store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRecord {
    pub key: String,
    pub fields: HashMap<String, String>,
}

/// Every hash whose key matches `pattern` (e.g. `booking:*`), ordered by key.
pub async fn hash_records<C: CacheStore + ?Sized>(
    cache: &C,
    pattern: &str,
    timeout: Duration,
) -> Result<Vec<HashRecord>, PipelineError> {
    let found = with_timeout("cache_scan_hashes", timeout, cache.scan_hashes(pattern))
        .await
        .map_err(PipelineError::source)?;
    debug!(pattern, records = found.len(), "Scanned hash records");
    Ok(found
        .into_iter()
        .map(|(key, fields)| HashRecord { key, fields })
        .collect())
}
