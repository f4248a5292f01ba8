// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Benchmark harness: relational source vs. cache-aside reads.
//!
//! # Protocol (per query)
//!
//! ```text
//! flush cache + reset source session
//!        │
//!        ▼
//! extract ─────────────► cold
//!        │
//!        ▼
//! populate cache ──(fails)──► record cold only, next query
//!        │
//!        ▼
//! fetch from cache ────► cache
//!        │
//!        ▼
//! extract again ───────► warm_source
//! ```
//!
//! Speedups are `cold / cache` and `warm_source / cache`. They stay `None`
//! when the cache step failed or measured zero; nothing here divides by zero
//! or reports an infinite ratio.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::cache::CacheAside;
use crate::error::PipelineError;
use crate::extract::extract;
use crate::metrics;
use crate::resilience::timeout::with_timeout;
use crate::storage::traits::{CacheStore, QueryParam, RelationalSource};

/// A named, parameterized query to benchmark. The SQL text is opaque here.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkQuery {
    pub name: String,
    pub sql: String,
    pub params: Vec<QueryParam>,
}

impl BenchmarkQuery {
    pub fn new(name: impl Into<String>, sql: impl Into<String>, params: Vec<QueryParam>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            params,
        }
    }

    /// Bookings with more than one ticket, by summed fare.
    #[must_use]
    pub fn booking_stats(limit: i64) -> Self {
        Self::new(
            "booking_stats",
            r"SELECT b.book_ref, b.book_date,
                     COUNT(t.ticket_no) AS tickets_count,
                     SUM(tf.amount) AS total_amount,
                     b.total_amount AS booking_amount
              FROM bookings b
              JOIN tickets t ON b.book_ref = t.book_ref
              JOIN ticket_flights tf ON t.ticket_no = tf.ticket_no
              GROUP BY b.book_ref, b.book_date, b.total_amount
              HAVING COUNT(t.ticket_no) > 1
              ORDER BY total_amount DESC
              LIMIT $1",
            vec![QueryParam::Int(limit)],
        )
    }

    /// Passengers on flights still in `Scheduled` status.
    #[must_use]
    pub fn scheduled_flights(limit: i64) -> Self {
        Self::new(
            "scheduled_flights",
            r"SELECT t.passenger_name, t.contact_data, f.flight_no, f.scheduled_departure
              FROM tickets t
              JOIN ticket_flights tf ON t.ticket_no = tf.ticket_no
              JOIN flights f ON tf.flight_id = f.flight_id
              WHERE f.status = $1
              ORDER BY f.scheduled_departure
              LIMIT $2",
            vec![QueryParam::Text("Scheduled".into()), QueryParam::Int(limit)],
        )
    }

    /// Per-route revenue with average duration, long-range counts and a revenue rank.
    #[must_use]
    pub fn route_analysis(limit: i64) -> Self {
        Self::new(
            "route_analysis",
            r"WITH route_stats AS (
                  SELECT f.departure_airport, f.arrival_airport,
                         COUNT(*) AS total_flights,
                         AVG(f.actual_arrival - f.actual_departure) AS avg_duration,
                         SUM(tf.amount) AS total_revenue
                  FROM flights f
                  JOIN ticket_flights tf ON f.flight_id = tf.flight_id
                  WHERE f.status = $1
                  GROUP BY f.departure_airport, f.arrival_airport
              )
              SELECT rs.*,
                     a1.airport_name AS departure_name,
                     a2.airport_name AS arrival_name,
                     a1.city AS departure_city,
                     a2.city AS arrival_city,
                     (SELECT COUNT(*) FROM flights f2
                      WHERE f2.departure_airport = rs.departure_airport
                        AND f2.arrival_airport = rs.arrival_airport
                        AND f2.aircraft_code IN (SELECT aircraft_code FROM aircrafts WHERE range > $2)
                     ) AS long_range_flights,
                     RANK() OVER (ORDER BY rs.total_revenue DESC) AS revenue_rank
              FROM route_stats rs
              JOIN airports a1 ON rs.departure_airport = a1.airport_code
              JOIN airports a2 ON rs.arrival_airport = a2.airport_code
              ORDER BY rs.total_revenue DESC
              LIMIT $3",
            vec![QueryParam::Text("Arrived".into()), QueryParam::Int(3000), QueryParam::Int(limit)],
        )
    }

    /// The three standard queries.
    #[must_use]
    pub fn standard_set() -> Vec<Self> {
        vec![Self::booking_stats(10), Self::scheduled_flights(10), Self::route_analysis(100)]
    }
}

/// One row of benchmark output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMeasurement {
    pub query: String,
    pub rows: usize,
    pub cold: Duration,
    pub cache: Option<Duration>,
    pub warm_source: Option<Duration>,
    pub speedup_vs_cold: Option<f64>,
    pub speedup_vs_warm_source: Option<f64>,
}

/// `numerator / denominator`, or `None` when that is undefined.
#[must_use]
pub fn speedup(numerator: Duration, denominator: Duration) -> Option<f64> {
    if denominator.is_zero() {
        return None;
    }
    let ratio = numerator.as_secs_f64() / denominator.as_secs_f64();
    ratio.is_finite().then_some(ratio)
}

pub struct BenchmarkHarness<S: ?Sized, C: ?Sized> {
    source: Arc<S>,
    cache: CacheAside<C>,
    timeout: Duration,
}

impl<S, C> BenchmarkHarness<S, C>
where
    S: RelationalSource + ?Sized,
    C: CacheStore + ?Sized,
{
    pub fn new(source: Arc<S>, cache: CacheAside<C>, timeout: Duration) -> Self {
        Self { source, cache, timeout }
    }

    /// Run every query in order. A source failure stops the run.
    pub async fn run(&self, queries: &[BenchmarkQuery]) -> Result<Vec<QueryMeasurement>, PipelineError> {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            results.push(self.measure(query).await?);
        }
        Ok(results)
    }

    pub async fn measure(&self, query: &BenchmarkQuery) -> Result<QueryMeasurement, PipelineError> {
        let name = query.name.as_str();

        // Cache flush failure only makes the numbers less comparable.
        if let Err(e) = self.cache.flush().await {
            warn!(query = name, error = %e, "Cache flush failed before measurement");
        }
        with_timeout("source_reset", self.timeout, self.source.reset())
            .await
            .map_err(PipelineError::source)?;

        let cold = extract(self.source.as_ref(), name, &query.sql, &query.params, self.timeout).await?;
        let mut measurement = QueryMeasurement {
            query: query.name.clone(),
            rows: cold.len(),
            cold: cold.duration,
            cache: None,
            warm_source: None,
            speedup_vs_cold: None,
            speedup_vs_warm_source: None,
        };

        if !self.cache.populate(name, &cold.rows).await {
            warn!(query = name, "No cache measurement for query");
            return Ok(measurement);
        }

        let fetched = self.cache.fetch(name).await;
        if !fetched.is_hit() {
            warn!(query = name, "Cache read missed right after populate");
            return Ok(measurement);
        }

        let warm = extract(self.source.as_ref(), name, &query.sql, &query.params, self.timeout).await?;

        measurement.cache = Some(fetched.duration);
        measurement.warm_source = Some(warm.duration);
        measurement.speedup_vs_cold = speedup(cold.duration, fetched.duration);
        measurement.speedup_vs_warm_source = speedup(warm.duration, fetched.duration);

        if let Some(ratio) = measurement.speedup_vs_cold {
            metrics::record_speedup(name, "vs_cold", ratio);
        }
        if let Some(ratio) = measurement.speedup_vs_warm_source {
            metrics::record_speedup(name, "vs_warm_source", ratio);
        }

        info!(
            query = name,
            rows = measurement.rows,
            cold_ms = cold.duration.as_secs_f64() * 1000.0,
            cache_ms = fetched.duration.as_secs_f64() * 1000.0,
            warm_source_ms = warm.duration.as_secs_f64() * 1000.0,
            "Measured query"
        );
        Ok(measurement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speedup_zero_denominator_is_none() {
        assert_eq!(speedup(Duration::from_millis(10), Duration::ZERO), None);
        assert_eq!(speedup(Duration::ZERO, Duration::ZERO), None);
    }

    #[test]
    fn test_speedup_ratio() {
        let r = speedup(Duration::from_millis(30), Duration::from_millis(3)).unwrap();
        assert!((r - 10.0).abs() < 1e-9);
        assert_eq!(speedup(Duration::ZERO, Duration::from_millis(1)), Some(0.0));
    }

    #[test]
    fn test_standard_queries_are_parameterized() {
        let set = BenchmarkQuery::standard_set();
        let names: Vec<_> = set.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, vec!["booking_stats", "scheduled_flights", "route_analysis"]);
        for q in &set {
            assert!(q.sql.contains("$1"));
            assert!(!q.params.is_empty());
        }
        assert_eq!(set[2].params.last(), Some(&QueryParam::Int(100)));
    }
}
