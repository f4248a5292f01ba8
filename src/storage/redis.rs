//! Redis cache store.
//!
//! Plain Redis commands only (no modules):
//!
//! | Operation | Command |
//! |---|---|
//! | cached dataset | `SETEX` / `GET` / `DEL` |
//! | ranked set | `ZADD`, `ZRANGE`/`ZREVRANGE ... WITHSCORES`, `ZRANGEBYSCORE` |
//! | snapshot replace | `MULTI` `DEL` + `ZADD` `EXEC` |
//! | hash records | `SCAN ... TYPE hash` then pipelined `HGETALL` |
//!
//! Key enumeration uses `SCAN`, never `KEYS`, so large keyspaces do not block
//! the server.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, AsyncCommands, Client, RedisError};
use tracing::debug;

use super::traits::{CacheStore, RangeOrder, StorageError};
use crate::metrics::LatencyTimer;
use crate::resilience::retry::{retry_when, RetryConfig};

const SCAN_BATCH: usize = 500;

/// Connection-class failures. These are retried and surface as `Unavailable`.
fn is_transient(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
}

fn classify(e: RedisError) -> StorageError {
    if is_transient(&e) {
        StorageError::Unavailable(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

pub struct RedisCache {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "bench:" → "bench:booking_stats")
    prefix: String,
}

impl RedisCache {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Create a cache whose keys all live under `prefix`.
    ///
    /// `flush_all` then only removes this prefix's keys instead of the whole
    /// database, which makes sharing a Redis instance safe.
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        // Use startup config: fast-fail after ~30s, don't hang forever
        let connection = retry_when("redis_connect", &RetryConfig::startup(), is_transient, || {
            ConnectionManager::new(client.clone())
        })
        .await
        .map_err(classify)?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    #[inline]
    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix).unwrap_or(key)
        }
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Every key matching `pattern` (already prefixed), optionally restricted to one Redis type.
    async fn scan_keys(&self, pattern: &str, type_filter: Option<&str>) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let mut scan = cmd("SCAN");
            scan.arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(SCAN_BATCH);
            if let Some(t) = type_filter {
                scan.arg("TYPE").arg(t);
            }
            let (next, batch): (u64, Vec<String>) = scan.query_async(&mut conn).await.map_err(classify)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn set_with_ttl(&self, key: &str, payload: &[u8], ttl_secs: u64) -> Result<(), StorageError> {
        let _timer = LatencyTimer::new("redis", "set_with_ttl");
        if ttl_secs == 0 {
            return Err(StorageError::Backend("SETEX requires a positive TTL".into()));
        }
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry_when("redis_setex", &RetryConfig::query(), is_transient, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let _: () = cmd("SETEX").arg(&key).arg(ttl_secs).arg(payload).query_async(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(classify)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let _timer = LatencyTimer::new("redis", "get");
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry_when("redis_get", &RetryConfig::query(), is_transient, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let data: Option<Vec<u8>> = conn.get(&key).await?;
                Ok(data)
            }
        })
        .await
        .map_err(classify)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry_when("redis_delete", &RetryConfig::query(), is_transient, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let _: () = conn.del(&key).await?;
                Ok(())
            }
        })
        .await
        .map_err(classify)
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry_when("redis_zadd", &RetryConfig::query(), is_transient, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let _: () = cmd("ZADD").arg(&key).arg(score).arg(member).query_async(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(classify)
    }

    /// `DEL` and `ZADD` run in one `MULTI`/`EXEC` block, so readers see the
    /// old snapshot or the new one.
    async fn sorted_set_replace(&self, key: &str, members: &[(String, f64)]) -> Result<(), StorageError> {
        let _timer = LatencyTimer::new("redis", "sorted_set_replace");
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry_when("redis_zreplace", &RetryConfig::query(), is_transient, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let mut pipeline = pipe();
                pipeline.atomic().del(&key).ignore();
                if !members.is_empty() {
                    let zadd = pipeline.cmd("ZADD").arg(&key);
                    for (member, score) in members {
                        zadd.arg(*score).arg(member.as_str());
                    }
                    zadd.ignore();
                }
                pipeline.query_async::<()>(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(classify)?;

        debug!(key = %key, members = members.len(), "Sorted set replaced");
        Ok(())
    }

    async fn sorted_set_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
        order: RangeOrder,
    ) -> Result<Vec<(String, f64)>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let command = match order {
            RangeOrder::Ascending => "ZRANGE",
            RangeOrder::Descending => "ZREVRANGE",
        };

        retry_when("redis_zrange", &RetryConfig::query(), is_transient, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let members: Vec<(String, f64)> = cmd(command)
                    .arg(&key)
                    .arg(start)
                    .arg(stop)
                    .arg("WITHSCORES")
                    .query_async(&mut conn)
                    .await?;
                Ok(members)
            }
        })
        .await
        .map_err(classify)
    }

    async fn sorted_set_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry_when("redis_zrangebyscore", &RetryConfig::query(), is_transient, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let members: Vec<(String, f64)> = cmd("ZRANGEBYSCORE")
                    .arg(&key)
                    .arg(min)
                    .arg(max)
                    .arg("WITHSCORES")
                    .query_async(&mut conn)
                    .await?;
                Ok(members)
            }
        })
        .await
        .map_err(classify)
    }

    async fn flush_all(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();

        if self.prefix.is_empty() {
            let _: () = cmd("FLUSHDB").query_async(&mut conn).await.map_err(classify)?;
            return Ok(());
        }

        let keys = self.scan_keys(&format!("{}*", self.prefix), None).await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut pipeline = pipe();
        for key in &keys {
            pipeline.del(key).ignore();
        }
        pipeline.query_async::<()>(&mut conn).await.map_err(classify)?;
        debug!(prefix = %self.prefix, keys = keys.len(), "Flushed prefixed keys");
        Ok(())
    }

    async fn scan_hashes(&self, pattern: &str) -> Result<Vec<(String, HashMap<String, String>)>, StorageError> {
        let _timer = LatencyTimer::new("redis", "scan_hashes");
        let keys = self.scan_keys(&self.prefixed_key(pattern), Some("hash")).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();
        let mut pipeline = pipe();
        for key in &keys {
            pipeline.hgetall(key);
        }
        let maps: Vec<HashMap<String, String>> = pipeline.query_async(&mut conn).await.map_err(classify)?;

        // A key can expire between SCAN and HGETALL; it then reads as empty.
        Ok(keys
            .iter()
            .zip(maps)
            .filter(|(_, fields)| !fields.is_empty())
            .map(|(key, fields)| (self.strip_prefix(key).to_string(), fields))
            .collect())
    }
}
