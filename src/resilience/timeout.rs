// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hard timeouts for network calls.
//!
//! None of the store contracts carry their own deadline, so every call the
//! pipeline makes goes through [`with_timeout`]. Expiry surfaces as
//! [`StorageError::Timeout`], which is fatal for the current batch.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::metrics;
use crate::storage::traits::StorageError;

pub async fn with_timeout<T, Fut>(
    operation: &str,
    limit: Duration,
    future: Fut,
) -> Result<T, StorageError>
where
    Fut: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, limit_ms = limit.as_millis() as u64, "Operation timed out");
            metrics::record_timeout(operation);
            Err(StorageError::Timeout {
                operation: operation.to_string(),
                elapsed_ms: limit.as_millis() as u64,
            })
        }
    }
}
