// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-aside layer over a [`CacheStore`].
//!
//! # Datasets
//!
//! One key per logical dataset: `{prefix}{name}`. The payload is the row set
//! after coercion, serialized as a JSON array of row mappings. A payload that
//! cannot be built (an unsupported column type, say) is reported as `false`
//! from [`CacheAside::populate`]; it never raises.
//!
//! # Ranked sets
//!
//! [`CacheAside::replace_ranked_set`] is a full-replacement snapshot: prior
//! members are discarded. Atomicity is whatever the store's
//! [`CacheStore::sorted_set_replace`] provides. Redis runs DEL + ZADD inside
//! `MULTI`/`EXEC`; the in-memory store swaps the whole set in one write; the
//! trait default is delete-then-add and readers can see the gap.
//!
//! [`CacheAside::top_n`] breaks score ties by member ascending in both
//! directions. Stores order ties their own way (Redis reverses member order
//! for `ZREVRANGE`), so the boundary tie group is re-read by score and the
//! cut happens here.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::coerce::row_to_document;
use crate::config::SyncConfig;
use crate::error::{PipelineError, TransformError};
use crate::metrics;
use crate::resilience::timeout::with_timeout;
use crate::storage::traits::{CacheStore, Document, RangeOrder, RowSet};
use crate::transform::{RankedTicket, ScoredMember};

/// Result of a cache read. `duration` is always measured, hit or miss.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheFetch {
    pub payload: Option<Vec<Document>>,
    pub duration: Duration,
}

impl CacheFetch {
    #[must_use]
    pub fn is_hit(&self) -> bool {
        self.payload.is_some()
    }
}

pub struct CacheAside<C: ?Sized> {
    store: Arc<C>,
    prefix: String,
    ttl_secs: u64,
    timeout: Duration,
}

impl<C: ?Sized> Clone for CacheAside<C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            prefix: self.prefix.clone(),
            ttl_secs: self.ttl_secs,
            timeout: self.timeout,
        }
    }
}

impl<C: CacheStore + ?Sized> CacheAside<C> {
    pub fn new(store: Arc<C>, config: &SyncConfig) -> Self {
        Self {
            store,
            prefix: config.cache_prefix.clone(),
            ttl_secs: config.cache_ttl_secs,
            timeout: config.op_timeout(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<C> {
        &self.store
    }

    #[must_use]
    pub fn dataset_key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Serialize and store a row set under the configured TTL.
    pub async fn populate(&self, name: &str, rows: &RowSet) -> bool {
        self.populate_with_ttl(name, rows, Duration::from_secs(self.ttl_secs)).await
    }

    pub async fn populate_with_ttl(&self, name: &str, rows: &RowSet, ttl: Duration) -> bool {
        let payload = match encode_rows(rows) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(dataset = name, error = %e, "Cannot serialize dataset for cache");
                metrics::record_cache_populate(name, false);
                return false;
            }
        };

        let key = self.dataset_key(name);
        // SETEX rejects zero; anything under a second rounds up.
        let ttl_secs = ttl.as_secs().max(1);
        let written = with_timeout(
            "cache_set",
            self.timeout,
            self.store.set_with_ttl(&key, &payload, ttl_secs),
        )
        .await;

        match written {
            Ok(()) => {
                debug!(dataset = name, bytes = payload.len(), ttl_secs, "Cached dataset");
                metrics::record_cache_populate(name, true);
                true
            }
            Err(e) => {
                warn!(dataset = name, error = %e, "Cache write failed");
                metrics::record_cache_populate(name, false);
                false
            }
        }
    }

    /// Read and deserialize a dataset, timing both steps together.
    ///
    /// A miss, a store error, and an unreadable payload all come back as an
    /// absent payload.
    pub async fn fetch(&self, name: &str) -> CacheFetch {
        let key = self.dataset_key(name);
        let start = Instant::now();

        let payload = match with_timeout("cache_get", self.timeout, self.store.get(&key)).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<Document>>(&bytes) {
                Ok(docs) => Some(docs),
                Err(e) => {
                    warn!(dataset = name, error = %e, "Cached payload unreadable");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(dataset = name, error = %e, "Cache read failed");
                None
            }
        };

        let duration = start.elapsed();
        metrics::record_cache_fetch(name, payload.is_some(), duration);
        CacheFetch { payload, duration }
    }

    /// Replace the sorted set at `set_key` with exactly `members`.
    pub async fn replace_ranked_set(&self, set_key: &str, members: &[ScoredMember]) -> Result<(), PipelineError> {
        let pairs: Vec<(String, f64)> = members.iter().map(|m| (m.member.clone(), m.score)).collect();
        with_timeout(
            "cache_sorted_set_replace",
            self.timeout,
            self.store.sorted_set_replace(set_key, &pairs),
        )
        .await
        .map_err(PipelineError::target)?;

        metrics::set_ranked_set_size(set_key, pairs.len());
        debug!(set = set_key, members = pairs.len(), "Replaced ranked set");
        Ok(())
    }

    /// The first `n` members by score in `order`, ties by member ascending.
    pub async fn top_n(&self, set_key: &str, n: usize, order: RangeOrder) -> Result<Vec<ScoredMember>, PipelineError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(n - 1).unwrap_or(isize::MAX);
        let window = with_timeout(
            "cache_sorted_set_range",
            self.timeout,
            self.store.sorted_set_range(set_key, 0, stop, order),
        )
        .await
        .map_err(PipelineError::target)?;

        let boundary = window.last().map(|(_, score)| *score);
        let mut candidates = match boundary {
            Some(boundary) if window.len() == n => {
                let ties = with_timeout(
                    "cache_sorted_set_range_by_score",
                    self.timeout,
                    self.store.sorted_set_range_by_score(set_key, boundary, boundary),
                )
                .await
                .map_err(PipelineError::target)?;
                let mut ahead: Vec<_> = window.into_iter().filter(|(_, s)| *s != boundary).collect();
                ahead.extend(ties);
                ahead
            }
            _ => window,
        };

        candidates.sort_by(|a, b| rank(a, b, order));
        candidates.truncate(n);
        Ok(candidates
            .into_iter()
            .map(|(member, score)| ScoredMember::new(member, score))
            .collect())
    }

    /// [`top_n`](Self::top_n) decoded into ranked tickets.
    ///
    /// Members that fail to decode are logged and dropped.
    pub async fn top_tickets(&self, set_key: &str, n: usize, order: RangeOrder) -> Result<Vec<(RankedTicket, f64)>, PipelineError> {
        let members = self.top_n(set_key, n, order).await?;
        Ok(members
            .into_iter()
            .filter_map(|m| match RankedTicket::from_member(&m.member) {
                Ok(ticket) => Some((ticket, m.score)),
                Err(TransformError { unit, kind }) => {
                    warn!(set = set_key, member = %unit, error = %kind, "Undecodable ranked member");
                    None
                }
            })
            .collect())
    }

    pub async fn flush(&self) -> Result<(), PipelineError> {
        with_timeout("cache_flush", self.timeout, self.store.flush_all())
            .await
            .map_err(PipelineError::target)
    }
}

fn rank(a: &(String, f64), b: &(String, f64), order: RangeOrder) -> Ordering {
    let by_score = match order {
        RangeOrder::Ascending => a.1.total_cmp(&b.1),
        RangeOrder::Descending => b.1.total_cmp(&a.1),
    };
    by_score.then_with(|| a.0.cmp(&b.0))
}

fn encode_rows(rows: &RowSet) -> Result<Vec<u8>, PipelineError> {
    let docs = rows
        .rows
        .iter()
        .map(|row| row_to_document(&rows.columns, row).map(Value::Object))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PipelineError::CacheSerialization(e.to_string()))?;
    serde_json::to_vec(&docs).map_err(|e| PipelineError::CacheSerialization(e.to_string()))
}
