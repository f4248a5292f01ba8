// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Type coercion between source-native values and the transport form.
//!
//! Every store boundary speaks JSON. Relational rows carry richer scalars,
//! so they are flattened on the way out:
//!
//! | Source value | Transport form |
//! |---|---|
//! | timestamp / timestamptz / date / time | ISO-8601 string |
//! | interval | total seconds (`f64`) |
//! | numeric (fixed-point decimal) | `f64` |
//! | json / jsonb | passed through |
//! | list / mapping | recursed element by element |
//!
//! Decimal → float loses precision beyond ~15 significant digits. This is
//! accepted and not corrected; no arithmetic that needs exact decimals runs
//! after the conversion.
//!
//! # Example
//!
//! ```
//! use cross_store_sync::coerce::{to_transport, parse_timestamp, SourceValue};
//! use chrono::NaiveDate;
//!
//! let ts = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap().and_hms_opt(10, 30, 0).unwrap();
//! let value = to_transport(&SourceValue::Timestamp(ts)).unwrap();
//! assert_eq!(value, "2024-03-15T10:30:00");
//! assert_eq!(parse_timestamp(value.as_str().unwrap()).unwrap(), ts);
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeDelta, Utc};
use serde_json::{Map, Number, Value};
use sqlx::types::BigDecimal;

use crate::error::CoercionError;

/// ISO-8601 without offset; fractional seconds only when non-zero.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S%.f";

/// A value as produced by a relational source, before coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Decimal(BigDecimal),
    Interval(TimeDelta),
    Json(Value),
    List(Vec<SourceValue>),
    Map(BTreeMap<String, SourceValue>),
    /// A column type the source could not decode (e.g. geometric types).
    Unsupported { type_name: String },
}

impl From<&str> for SourceValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for SourceValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for SourceValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for SourceValue {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

/// Convert a source value into its transport representation.
pub fn to_transport(value: &SourceValue) -> Result<Value, CoercionError> {
    Ok(match value {
        SourceValue::Null => Value::Null,
        SourceValue::Bool(b) => Value::Bool(*b),
        SourceValue::Int(n) => Value::Number((*n).into()),
        SourceValue::Float(f) => float_value(*f)?,
        SourceValue::Text(s) => Value::String(s.clone()),
        SourceValue::Timestamp(ts) => Value::String(format_timestamp(ts)),
        SourceValue::TimestampTz(ts) => {
            Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, false))
        }
        SourceValue::Date(d) => Value::String(d.format(DATE_FORMAT).to_string()),
        SourceValue::Time(t) => Value::String(t.format(TIME_FORMAT).to_string()),
        SourceValue::Decimal(d) => float_value(decimal_to_f64(d)?)?,
        SourceValue::Interval(d) => float_value(interval_to_seconds(d))?,
        SourceValue::Json(v) => v.clone(),
        SourceValue::List(items) => Value::Array(
            items.iter().map(to_transport).collect::<Result<Vec<_>, _>>()?,
        ),
        SourceValue::Map(fields) => {
            let mut map = Map::with_capacity(fields.len());
            for (k, v) in fields {
                map.insert(k.clone(), to_transport(v)?);
            }
            Value::Object(map)
        }
        SourceValue::Unsupported { type_name } => {
            return Err(CoercionError::UnsupportedType {
                type_name: type_name.clone(),
            })
        }
    })
}

/// Zip a row with its column names into a transport document.
///
/// A row whose width differs from `columns` is rejected rather than truncated.
pub fn row_to_document(
    columns: &[String],
    row: &[SourceValue],
) -> Result<Map<String, Value>, CoercionError> {
    if row.len() != columns.len() {
        return Err(CoercionError::RowWidth {
            values: row.len(),
            columns: columns.len(),
        });
    }
    let mut doc = Map::with_capacity(columns.len());
    for (column, value) in columns.iter().zip(row) {
        doc.insert(column.clone(), to_transport(value)?);
    }
    Ok(doc)
}

fn float_value(f: f64) -> Result<Value, CoercionError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| CoercionError::UnsupportedType {
            type_name: format!("non-finite float ({f})"),
        })
}

#[must_use]
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Strict parse of the transport timestamp form (`YYYY-MM-DDTHH:MM:SS[.ffffff]`).
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, CoercionError> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).map_err(|e| {
        CoercionError::InvalidTemporal {
            input: s.to_string(),
            reason: e.to_string(),
        }
    })
}

pub fn parse_date(s: &str) -> Result<NaiveDate, CoercionError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|e| CoercionError::InvalidTemporal {
        input: s.to_string(),
        reason: e.to_string(),
    })
}

/// Parse any temporal transport form: RFC 3339 with offset, naive timestamp, or date.
///
/// Offsets are normalized to UTC before the offset is dropped.
pub fn parse_temporal(s: &str) -> Result<NaiveDateTime, CoercionError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_utc());
    }
    if let Ok(ts) = parse_timestamp(s) {
        return Ok(ts);
    }
    parse_date(s).map(|d| d.and_time(NaiveTime::default()))
}

#[must_use]
pub fn interval_to_seconds(d: &TimeDelta) -> f64 {
    match d.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => d.num_seconds() as f64,
    }
}

/// Rebuild an interval from its total-seconds transport form (microsecond resolution).
pub fn seconds_to_interval(secs: f64) -> Result<TimeDelta, CoercionError> {
    if !secs.is_finite() || secs.abs() > (i64::MAX / 1_000_000) as f64 {
        return Err(CoercionError::InvalidNumber {
            input: secs.to_string(),
        });
    }
    Ok(TimeDelta::microseconds((secs * 1_000_000.0).round() as i64))
}

pub fn decimal_to_f64(d: &BigDecimal) -> Result<f64, CoercionError> {
    let text = d.to_string();
    text.parse::<f64>()
        .map_err(|_| CoercionError::InvalidNumber { input: text })
}

/// Render a transport scalar as plain text (strings unquoted, null empty).
#[must_use]
pub fn transport_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
