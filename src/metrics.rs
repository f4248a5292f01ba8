// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation.
//!
//! Uses the `metrics` crate for backend-agnostic collection. The embedding
//! process chooses the exporter (Prometheus, OTEL, ...).
//!
//! # Metric Naming Convention
//! - `cross_store_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `store`: source, document, cache
//! - `entity`: booking, ticket, flight, airport
//! - `outcome`: inserted, skipped_duplicate, rejected_missing_parent, failed

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a source extraction
pub fn record_extraction(query: &str, rows: usize, duration: Duration) {
    histogram!(
        "cross_store_sync_extraction_seconds",
        "query" => query.to_string()
    )
    .record(duration.as_secs_f64());
    histogram!("cross_store_sync_extraction_rows").record(rows as f64);
}

pub fn record_extraction_failure(query: &str) {
    counter!(
        "cross_store_sync_extraction_failures_total",
        "query" => query.to_string()
    )
    .increment(1);
}

/// Record the terminal state of one record load
pub fn record_load_outcome(entity: &str, outcome: &str) {
    counter!(
        "cross_store_sync_load_outcomes_total",
        "entity" => entity.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_batch_aborted(entity: &str) {
    counter!(
        "cross_store_sync_batches_aborted_total",
        "entity" => entity.to_string()
    )
    .increment(1);
}

pub fn record_transform_error(strategy: &str) {
    counter!(
        "cross_store_sync_transform_errors_total",
        "strategy" => strategy.to_string()
    )
    .increment(1);
}

pub fn record_cache_populate(dataset: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "cross_store_sync_cache_populate_total",
        "dataset" => dataset.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a cache read; `hit` is false on a miss or an unreadable payload
pub fn record_cache_fetch(dataset: &str, hit: bool, duration: Duration) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "cross_store_sync_cache_fetch_total",
        "dataset" => dataset.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("cross_store_sync_cache_fetch_seconds").record(duration.as_secs_f64());
}

pub fn set_ranked_set_size(set_key: &str, members: usize) {
    gauge!(
        "cross_store_sync_ranked_set_members",
        "set" => set_key.to_string()
    )
    .set(members as f64);
}

/// Record a computed speedup ratio (`kind`: vs_cold, vs_warm_source)
pub fn record_speedup(query: &str, kind: &str, ratio: f64) {
    gauge!(
        "cross_store_sync_cache_speedup",
        "query" => query.to_string(),
        "kind" => kind.to_string()
    )
    .set(ratio);
}

pub fn record_timeout(operation: &str) {
    counter!(
        "cross_store_sync_timeouts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(store: &str, operation: &str, duration: Duration) {
    histogram!(
        "cross_store_sync_operation_seconds",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    store: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(store: &'static str, operation: &'static str) -> Self {
        Self {
            store,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.store, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_load_outcome_counter_is_labelled() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_load_outcome("ticket", "rejected_missing_parent");
            record_load_outcome("ticket", "rejected_missing_parent");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let (_, _, _, value) = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "cross_store_sync_load_outcomes_total")
            .expect("counter recorded");
        assert_eq!(*value, DebugValue::Counter(2));
    }

    #[test]
    fn test_recorders_without_exporter_do_not_panic() {
        record_extraction("booking_stats", 10, Duration::from_millis(3));
        record_extraction_failure("booking_stats");
        record_batch_aborted("booking");
        record_transform_error("nested_fold");
        record_cache_populate("booking_stats", false);
        record_cache_fetch("booking_stats", true, Duration::from_micros(80));
        set_ranked_set_size("ticket_flights:amount", 10);
        record_speedup("booking_stats", "vs_cold", 12.5);
        record_timeout("redis_get");
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("cache", "get");
            std::thread::sleep(Duration::from_micros(10));
        }
    }
}
