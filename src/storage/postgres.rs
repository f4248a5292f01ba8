// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Postgres relational source.
//!
//! Rows are decoded column by column from the Postgres type name into
//! [`SourceValue`]. Types without a mapping (geometric types, ranges, ...)
//! come back as [`SourceValue::Unsupported`] rather than failing the query,
//! so the caller decides whether the row can still be used.
//!
//! | Postgres | SourceValue |
//! |---|---|
//! | `BOOL` | `Bool` |
//! | `INT2` / `INT4` / `INT8` | `Int` |
//! | `FLOAT4` / `FLOAT8` | `Float` |
//! | `NUMERIC` | `Decimal` |
//! | `TEXT` / `VARCHAR` / `BPCHAR` / `NAME` | `Text` |
//! | `TIMESTAMP` / `TIMESTAMPTZ` / `DATE` / `TIME` | temporal variants |
//! | `INTERVAL` | `Interval` (a month counts as 30 days) |
//! | `JSON` / `JSONB` | `Json` |
//! | `TEXT[]` / `VARCHAR[]` / `INT4[]` / `INT8[]` | `List` |

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use serde_json::Value;
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::BigDecimal;
use sqlx::{Column, Executor, Row, TypeInfo, ValueRef};
use tracing::debug;

use super::sql::classify_sqlx_error;
use super::traits::{QueryParam, RelationalSource, RowSet, StorageError};
use crate::coerce::SourceValue;
use crate::metrics::LatencyTimer;
use crate::resilience::retry::{retry_when, RetryConfig};

pub struct PgSource {
    pool: PgPool,
}

impl PgSource {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_max_connections(connection_string, 5).await
    }

    /// `reset` discards state on one pooled connection, so benchmarks that
    /// need every query cold should use a single connection.
    pub async fn with_max_connections(connection_string: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = retry_when("pg_connect", &RetryConfig::startup(), StorageError::is_fatal, || async {
            PgPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(classify_sqlx_error)
        })
        .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn execute_once(&self, query: &str, params: &[QueryParam]) -> Result<RowSet, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(classify_sqlx_error)?;

        // Connection acquisition is not part of the measurement.
        let start = Instant::now();

        let mut q = sqlx::query(query);
        for param in params {
            q = match param {
                QueryParam::Null => q.bind(None::<String>),
                QueryParam::Bool(b) => q.bind(*b),
                QueryParam::Int(i) => q.bind(*i),
                QueryParam::Float(f) => q.bind(*f),
                QueryParam::Text(s) => q.bind(s.clone()),
                QueryParam::Timestamp(ts) => q.bind(*ts),
            };
        }
        let rows = q.fetch_all(&mut *conn).await.map_err(classify_sqlx_error)?;

        let columns: Vec<String> = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None => {
                let described = (&mut *conn).describe(query).await.map_err(classify_sqlx_error)?;
                described.columns().iter().map(|c| c.name().to_string()).collect()
            }
        };

        let decoded = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        let elapsed = start.elapsed();

        debug!(rows = decoded.len(), elapsed_ms = elapsed.as_millis() as u64, "Postgres query complete");
        Ok(RowSet {
            columns,
            rows: decoded,
            elapsed,
        })
    }
}

#[async_trait]
impl RelationalSource for PgSource {
    async fn execute(&self, query: &str, params: &[QueryParam]) -> Result<RowSet, StorageError> {
        let _timer = LatencyTimer::new("postgres", "execute");
        retry_when("pg_execute", &RetryConfig::query(), StorageError::is_fatal, || {
            self.execute_once(query, params)
        })
        .await
    }

    async fn reset(&self) -> Result<(), StorageError> {
        sqlx::query("DISCARD ALL")
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(())
    }
}

fn decode_row(row: &PgRow) -> Result<Vec<SourceValue>, StorageError> {
    (0..row.columns().len()).map(|i| decode_column(row, i)).collect()
}

fn decode_column(row: &PgRow, index: usize) -> Result<SourceValue, StorageError> {
    let raw = row.try_get_raw(index).map_err(classify_sqlx_error)?;
    if raw.is_null() {
        return Ok(SourceValue::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let value = match type_name.as_str() {
        "BOOL" => SourceValue::Bool(get::<bool>(row, index)?),
        "INT2" => SourceValue::Int(i64::from(get::<i16>(row, index)?)),
        "INT4" => SourceValue::Int(i64::from(get::<i32>(row, index)?)),
        "INT8" => SourceValue::Int(get::<i64>(row, index)?),
        "FLOAT4" => SourceValue::Float(f64::from(get::<f32>(row, index)?)),
        "FLOAT8" => SourceValue::Float(get::<f64>(row, index)?),
        "NUMERIC" => SourceValue::Decimal(get::<BigDecimal>(row, index)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => SourceValue::Text(get::<String>(row, index)?),
        "TIMESTAMP" => SourceValue::Timestamp(get::<NaiveDateTime>(row, index)?),
        "TIMESTAMPTZ" => SourceValue::TimestampTz(get::<DateTime<Utc>>(row, index)?),
        "DATE" => SourceValue::Date(get::<NaiveDate>(row, index)?),
        "TIME" => SourceValue::Time(get::<NaiveTime>(row, index)?),
        "INTERVAL" => SourceValue::Interval(interval_to_delta(&get::<PgInterval>(row, index)?)),
        "JSON" | "JSONB" => SourceValue::Json(get::<Value>(row, index)?),
        "TEXT[]" | "VARCHAR[]" => SourceValue::List(
            get::<Vec<String>>(row, index)?.into_iter().map(SourceValue::Text).collect(),
        ),
        "INT4[]" => SourceValue::List(
            get::<Vec<i32>>(row, index)?
                .into_iter()
                .map(|i| SourceValue::Int(i64::from(i)))
                .collect(),
        ),
        "INT8[]" => SourceValue::List(get::<Vec<i64>>(row, index)?.into_iter().map(SourceValue::Int).collect()),
        _ => SourceValue::Unsupported { type_name },
    };
    Ok(value)
}

fn get<'r, T>(row: &'r PgRow, index: usize) -> Result<T, StorageError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get::<T, _>(index).map_err(classify_sqlx_error)
}

/// Months have no fixed length; they are taken as 30 days.
fn interval_to_delta(interval: &PgInterval) -> TimeDelta {
    let days = i64::from(interval.months) * 30 + i64::from(interval.days);
    TimeDelta::days(days) + TimeDelta::microseconds(interval.microseconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_months_are_thirty_days() {
        let interval = PgInterval {
            months: 1,
            days: 2,
            microseconds: 3_600_000_000,
        };
        let delta = interval_to_delta(&interval);
        assert_eq!(delta, TimeDelta::days(32) + TimeDelta::hours(1));
    }

    #[test]
    fn test_negative_interval() {
        let interval = PgInterval {
            months: 0,
            days: -1,
            microseconds: 0,
        };
        assert_eq!(interval_to_delta(&interval).num_seconds(), -86_400);
    }
}
