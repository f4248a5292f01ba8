//! In-memory implementations of the three store contracts.
//!
//! Used by tests and the demo. Each store has an availability switch so
//! connectivity loss can be simulated mid-batch.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use super::traits::{
    CacheStore, Document, DocumentFilter, DocumentStore, InsertOutcome, QueryParam, RangeOrder,
    RelationalSource, RowSet, StorageError,
};

fn refused(store: &str) -> StorageError {
    StorageError::Unavailable(format!("{store} connection refused"))
}

// ═══════════════════════════════════════════════════════════════════════════
// Relational source
// ═══════════════════════════════════════════════════════════════════════════

/// Canned query results keyed by query text. Parameters are ignored.
pub struct InMemorySource {
    results: DashMap<String, RowSet>,
    available: AtomicBool,
    latency: Duration,
    executions: AtomicUsize,
    resets: AtomicUsize,
}

impl InMemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            results: DashMap::new(),
            available: AtomicBool::new(true),
            latency: Duration::ZERO,
            executions: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_result(self, query: &str, rows: RowSet) -> Self {
        self.set_result(query, rows);
        self
    }

    /// Simulated execute time, added to every query.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_result(&self, query: &str, rows: RowSet) {
        self.results.insert(query.trim().to_string(), rows);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationalSource for InMemorySource {
    async fn execute(&self, query: &str, _params: &[QueryParam]) -> Result<RowSet, StorageError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(refused("source"));
        }
        self.executions.fetch_add(1, Ordering::SeqCst);

        let start = Instant::now();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut rows = self
            .results
            .get(query.trim())
            .map(|r| r.value().clone())
            .ok_or_else(|| StorageError::Backend(format!("relation for query not found: {}", query.trim())))?;
        rows.elapsed = start.elapsed();
        Ok(rows)
    }

    async fn reset(&self) -> Result<(), StorageError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Document store
// ═══════════════════════════════════════════════════════════════════════════

/// Collections of documents, each ordered by key.
pub struct InMemoryDocumentStore {
    collections: DashMap<String, BTreeMap<String, Document>>,
    available: AtomicBool,
    rejected_keys: DashSet<String>,
}

impl InMemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            available: AtomicBool::new(true),
            rejected_keys: DashSet::new(),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every write of `key` fail with a backend error.
    pub fn fail_key(&self, key: &str) {
        self.rejected_keys.insert(key.to_string());
    }

    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }

    #[must_use]
    pub fn get(&self, collection: &str, key: &str) -> Option<Document> {
        self.collections.get(collection).and_then(|c| c.get(key).cloned())
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(refused("document store"))
        }
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn find(&self, collection: &str, filter: &DocumentFilter) -> Result<Vec<Document>, StorageError> {
        self.check()?;
        Ok(self
            .collections
            .get(collection)
            .map(|c| {
                c.iter()
                    .filter(|(key, doc)| filter.matches(key, doc))
                    .map(|(_, doc)| doc.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn exists(&self, collection: &str, key: &str) -> Result<bool, StorageError> {
        self.check()?;
        Ok(self
            .collections
            .get(collection)
            .is_some_and(|c| c.contains_key(key)))
    }

    async fn insert_one(&self, collection: &str, key: &str, doc: &Document) -> Result<InsertOutcome, StorageError> {
        self.check()?;
        if self.rejected_keys.contains(key) {
            return Err(StorageError::Backend(format!("write rejected for '{key}'")));
        }
        // The shard lock on the collection makes check-and-insert one step.
        let mut docs = self.collections.entry(collection.to_string()).or_default();
        Ok(match docs.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(doc.clone());
                InsertOutcome::Inserted
            }
            Entry::Occupied(_) => InsertOutcome::AlreadyPresent,
        })
    }

    async fn count_documents(&self, collection: &str, filter: &DocumentFilter) -> Result<u64, StorageError> {
        self.check()?;
        Ok(self.collections.get(collection).map_or(0, |c| {
            c.iter().filter(|(key, doc)| filter.matches(key, doc)).count() as u64
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Cache store
// ═══════════════════════════════════════════════════════════════════════════

struct CacheEntry {
    payload: Vec<u8>,
    expires_at: Instant,
}

/// Redis-shaped cache: expiring strings, sorted sets, and hashes.
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
    /// Kept ascending by (score, member), matching Redis ordering.
    sorted_sets: DashMap<String, Vec<(String, f64)>>,
    hashes: DashMap<String, HashMap<String, String>>,
    available: AtomicBool,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            sorted_sets: DashMap::new(),
            hashes: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Seed a hash record (the equivalent of `HSET key f1 v1 f2 v2 ...`).
    pub fn put_hash<K: Into<String>, V: Into<String>>(&self, key: &str, fields: impl IntoIterator<Item = (K, V)>) {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        for (k, v) in fields {
            hash.insert(k.into(), v.into());
        }
    }

    #[must_use]
    pub fn sorted_set_len(&self, key: &str) -> usize {
        self.sorted_sets.get(key).map_or(0, |s| s.len())
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(refused("cache"))
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

fn by_score(a: &(String, f64), b: &(String, f64)) -> std::cmp::Ordering {
    a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0))
}

/// Clamp Redis-style inclusive indices to `[0, len)`.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start >= len || start > stop {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

/// Redis glob subset: `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn set_with_ttl(&self, key: &str, payload: &[u8], ttl_secs: u64) -> Result<(), StorageError> {
        self.check()?;
        if ttl_secs == 0 {
            return Err(StorageError::Backend("invalid expire time in 'setex' command".into()));
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                payload: payload.to_vec(),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check()?;
        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.expires_at > Instant::now() => return Ok(Some(entry.payload.clone())),
            Some(_) => true,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.entries.remove(key);
        self.sorted_sets.remove(key);
        self.hashes.remove(key);
        Ok(())
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<(), StorageError> {
        self.check()?;
        let mut set = self.sorted_sets.entry(key.to_string()).or_default();
        set.retain(|(m, _)| m != member);
        let item = (member.to_string(), score);
        let pos = set.binary_search_by(|probe| by_score(probe, &item)).unwrap_or_else(|p| p);
        set.insert(pos, item);
        Ok(())
    }

    /// Builds the new set off to the side and swaps it in with one map write.
    async fn sorted_set_replace(&self, key: &str, members: &[(String, f64)]) -> Result<(), StorageError> {
        self.check()?;
        let mut fresh: Vec<(String, f64)> = Vec::with_capacity(members.len());
        for (member, score) in members {
            fresh.retain(|(m, _)| m != member);
            fresh.push((member.clone(), *score));
        }
        fresh.sort_by(by_score);

        if fresh.is_empty() {
            self.sorted_sets.remove(key);
        } else {
            self.sorted_sets.insert(key.to_string(), fresh);
        }
        Ok(())
    }

    async fn sorted_set_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
        order: RangeOrder,
    ) -> Result<Vec<(String, f64)>, StorageError> {
        self.check()?;
        let Some(set) = self.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };
        let Some((from, to)) = resolve_range(set.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(match order {
            RangeOrder::Ascending => set[from..=to].to_vec(),
            RangeOrder::Descending => set.iter().rev().skip(from).take(to - from + 1).cloned().collect(),
        })
    }

    async fn sorted_set_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>, StorageError> {
        self.check()?;
        Ok(self
            .sorted_sets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| *score >= min && *score <= max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn flush_all(&self) -> Result<(), StorageError> {
        self.check()?;
        self.entries.clear();
        self.sorted_sets.clear();
        self.hashes.clear();
        Ok(())
    }

    async fn scan_hashes(&self, pattern: &str) -> Result<Vec<(String, HashMap<String, String>)>, StorageError> {
        self.check()?;
        let mut found: Vec<_> = self
            .hashes
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}
