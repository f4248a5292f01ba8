// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transformation of extracted rows into target shapes.
//!
//! Two strategies:
//!
//! 1. **Nested-document fold** ([`fold_documents`]): a flat join of parent and
//!    repeated child rows (or a pre-grouped composite column) becomes one
//!    document per distinct parent key, children collected under a named field.
//!    Groups keep extraction order; rows within a group keep extraction order.
//!
//! 2. **Scored-member composition** ([`ranked_members`]): one numeric column
//!    becomes the score, the remaining columns are joined into one opaque
//!    member string with [`encode_member`].
//!
//! Failures are scoped to a unit (one group or one row) so the caller can skip
//! it and keep going. Only a spec/column mismatch fails the whole input.
//!
//! # Member encoding
//!
//! Fields are joined with [`MEMBER_DELIMITER`] (`:`). Timestamps and passenger
//! names can contain the delimiter, so inside a field `\` is written `\\` and
//! `:` is written `\:`. [`decode_member`] reverses this and rejects dangling or
//! unknown escapes.
//!
//! ```
//! use cross_store_sync::transform::{decode_member, encode_member};
//!
//! let member = encode_member(&["0005432000284", "2017-08-01T06:05:00"]);
//! assert_eq!(member, r"0005432000284:2017-08-01T06\:05\:00");
//! assert_eq!(decode_member(&member).unwrap(), vec!["0005432000284", "2017-08-01T06:05:00"]);
//! ```

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::coerce::{parse_date, parse_timestamp, to_transport, transport_text, SourceValue};
use crate::error::{CoercionError, TransformError, TransformErrorKind};
use crate::extract::HashRecord;
use crate::model::{BookingRecord, FlightRecord, TicketRecord};
use crate::storage::traits::{Document, RowSet};

pub const MEMBER_DELIMITER: char = ':';
pub const MEMBER_ESCAPE: char = '\\';

// ═══════════════════════════════════════════════════════════════════════════
// Nested-document fold
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct FieldMap {
    column: String,
    field: String,
    optional: bool,
}

#[derive(Debug, Clone)]
enum ChildSource {
    Rows(Box<FoldSpec>),
    /// Column already holding an ordered sequence of child mappings.
    Composite(String),
}

/// One level of a nested fold.
///
/// The root level must be keyed. Nested levels are either keyed (rows sharing
/// a key collapse into one child) or unkeyed (every row is one child).
#[derive(Debug, Clone)]
pub struct FoldSpec {
    key_column: Option<String>,
    fields: Vec<FieldMap>,
    children: Option<(String, ChildSource)>,
}

impl FoldSpec {
    pub fn keyed(key_column: impl Into<String>) -> Self {
        Self {
            key_column: Some(key_column.into()),
            fields: Vec::new(),
            children: None,
        }
    }

    #[must_use]
    pub fn unkeyed() -> Self {
        Self {
            key_column: None,
            fields: Vec::new(),
            children: None,
        }
    }

    #[must_use]
    pub fn field(mut self, column: impl Into<String>, field: impl Into<String>) -> Self {
        self.fields.push(FieldMap {
            column: column.into(),
            field: field.into(),
            optional: false,
        });
        self
    }

    /// Like [`field`](Self::field), but silently omitted when the row set lacks the column.
    #[must_use]
    pub fn optional_field(mut self, column: impl Into<String>, field: impl Into<String>) -> Self {
        self.fields.push(FieldMap {
            column: column.into(),
            field: field.into(),
            optional: true,
        });
        self
    }

    #[must_use]
    pub fn children(mut self, field: impl Into<String>, level: FoldSpec) -> Self {
        self.children = Some((field.into(), ChildSource::Rows(Box::new(level))));
        self
    }

    #[must_use]
    pub fn composite_children(mut self, field: impl Into<String>, column: impl Into<String>) -> Self {
        self.children = Some((field.into(), ChildSource::Composite(column.into())));
        self
    }

    fn validate(&self, rows: &RowSet) -> Result<(), TransformErrorKind> {
        if let Some(key) = &self.key_column {
            column_index(rows, key)?;
        }
        for f in self.fields.iter().filter(|f| !f.optional) {
            column_index(rows, &f.column)?;
        }
        match &self.children {
            Some((_, ChildSource::Rows(child))) => child.validate(rows),
            Some((_, ChildSource::Composite(column))) => column_index(rows, column).map(|_| ()),
            None => Ok(()),
        }
    }
}

/// A folded document with its grouping key.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedDocument {
    pub key: String,
    pub body: Document,
}

/// Fold rows into one document per distinct root key.
///
/// The outer `Err` means the fold does not fit the row set at all. Inner
/// errors are per group (or per row with an unusable key).
pub fn fold_documents(
    spec: &FoldSpec,
    rows: &RowSet,
) -> Result<Vec<Result<NestedDocument, TransformError>>, TransformError> {
    let key_column = spec.key_column.as_deref().ok_or_else(|| {
        TransformError::new("<spec>", TransformErrorKind::Shape("root level needs a key column".into()))
    })?;
    spec.validate(rows).map_err(|kind| TransformError::new("<spec>", kind))?;
    let key_idx = column_index(rows, key_column).map_err(|kind| TransformError::new("<spec>", kind))?;

    let mut results = Vec::new();
    let mut well_formed = Vec::with_capacity(rows.rows.len());
    for i in 0..rows.rows.len() {
        match check_width(rows, i) {
            Ok(()) => well_formed.push(i),
            Err(kind) => results.push(Err(TransformError::new(format!("row {i}"), kind))),
        }
    }
    let (groups, bad_rows) = group_rows(rows, &well_formed, key_idx);

    for (row, kind) in bad_rows {
        results.push(Err(TransformError::new(format!("row {row}"), kind)));
    }
    for (key, members) in groups {
        let folded = fold_group(spec, rows, &members)
            .map(|body| NestedDocument { key: key.clone(), body })
            .map_err(|kind| TransformError::new(key, kind));
        results.push(folded);
    }
    Ok(results)
}

/// Deserialize a folded document into its typed form.
pub fn into_typed<T: DeserializeOwned>(doc: NestedDocument) -> Result<T, TransformError> {
    let NestedDocument { key, body } = doc;
    serde_json::from_value(Value::Object(body))
        .map_err(|e| TransformError::new(key, TransformErrorKind::Shape(e.to_string())))
}

type Groups = Vec<(String, Vec<usize>)>;

/// Rows are indexed by column position, so a ragged row cannot be folded.
fn check_width(rows: &RowSet, i: usize) -> Result<(), TransformErrorKind> {
    let values = rows.rows[i].len();
    let columns = rows.columns.len();
    if values == columns {
        Ok(())
    } else {
        Err(TransformErrorKind::Shape(format!("row has {values} values for {columns} columns")))
    }
}

/// Group row indices by key, preserving first-seen order.
fn group_rows(rows: &RowSet, indices: &[usize], key_idx: usize) -> (Groups, Vec<(usize, TransformErrorKind)>) {
    let mut groups: Groups = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut bad = Vec::new();

    for &i in indices {
        match group_key(&rows.rows[i][key_idx]) {
            Ok(Some(key)) => match positions.get(&key) {
                Some(&pos) => groups[pos].1.push(i),
                None => {
                    positions.insert(key.clone(), groups.len());
                    groups.push((key, vec![i]));
                }
            },
            Ok(None) => bad.push((i, TransformErrorKind::Shape("null grouping key".into()))),
            Err(e) => bad.push((i, e.into())),
        }
    }
    (groups, bad)
}

fn group_key(value: &SourceValue) -> Result<Option<String>, CoercionError> {
    Ok(match to_transport(value)? {
        Value::Null => None,
        other => Some(transport_text(&other)),
    })
}

fn fold_group(spec: &FoldSpec, rows: &RowSet, members: &[usize]) -> Result<Document, TransformErrorKind> {
    let first = &rows.rows[members[0]];
    let mut doc = Map::with_capacity(spec.fields.len() + 1);

    for f in &spec.fields {
        match rows.column_index(&f.column) {
            Some(idx) => {
                doc.insert(f.field.clone(), to_transport(&first[idx])?);
            }
            None if f.optional => {}
            None => return Err(TransformErrorKind::MissingColumn(f.column.clone())),
        }
    }

    if let Some((field, source)) = &spec.children {
        let children = match source {
            ChildSource::Rows(child) => fold_children(child, rows, members)?,
            ChildSource::Composite(column) => composite_children(rows, members, column)?,
        };
        doc.insert(field.clone(), Value::Array(children));
    }
    Ok(doc)
}

fn fold_children(spec: &FoldSpec, rows: &RowSet, members: &[usize]) -> Result<Vec<Value>, TransformErrorKind> {
    let mut children = Vec::new();
    match &spec.key_column {
        Some(key_column) => {
            let key_idx = column_index(rows, key_column)?;
            // Outer joins produce rows without a child; those have a null key.
            let non_null: Vec<usize> = members
                .iter()
                .copied()
                .filter(|&i| rows.rows[i][key_idx] != SourceValue::Null)
                .collect();
            let (groups, mut bad) = group_rows(rows, &non_null, key_idx);
            if let Some((_, kind)) = bad.pop() {
                return Err(kind);
            }
            for (_, group) in groups {
                children.push(Value::Object(fold_group(spec, rows, &group)?));
            }
        }
        None => {
            for &i in members {
                if all_fields_null(spec, rows, i) {
                    continue;
                }
                children.push(Value::Object(fold_group(spec, rows, &[i])?));
            }
        }
    }
    Ok(children)
}

fn all_fields_null(spec: &FoldSpec, rows: &RowSet, row: usize) -> bool {
    spec.fields.iter().all(|f| {
        rows.column_index(&f.column)
            .map_or(true, |idx| rows.rows[row][idx] == SourceValue::Null)
    })
}

fn composite_children(rows: &RowSet, members: &[usize], column: &str) -> Result<Vec<Value>, TransformErrorKind> {
    let idx = column_index(rows, column)?;
    let mut children = Vec::new();
    for &i in members {
        match to_transport(&rows.rows[i][idx])? {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    if !item.is_object() {
                        return Err(TransformErrorKind::Shape(format!(
                            "column '{column}' holds a non-mapping child"
                        )));
                    }
                    children.push(item);
                }
            }
            _ => {
                return Err(TransformErrorKind::Shape(format!(
                    "column '{column}' is not a sequence"
                )))
            }
        }
    }
    Ok(children)
}

fn column_index(rows: &RowSet, column: &str) -> Result<usize, TransformErrorKind> {
    rows.column_index(column)
        .ok_or_else(|| TransformErrorKind::MissingColumn(column.to_string()))
}

/// booking → tickets → flight segments, from a flat three-way join.
#[must_use]
pub fn booking_fold() -> FoldSpec {
    FoldSpec::keyed("book_ref")
        .field("book_ref", "booking_ref")
        .field("book_date", "booking_date")
        .field("total_amount", "total_amount")
        .children(
            "tickets",
            FoldSpec::keyed("ticket_no")
                .field("ticket_no", "ticket_no")
                .field("passenger_name", "passenger")
                .optional_field("contact_data", "contact_data")
                .children(
                    "flights",
                    FoldSpec::unkeyed()
                        .field("flight_no", "flight_no")
                        .field("departure_airport", "departure_airport")
                        .field("arrival_airport", "arrival_airport")
                        .field("scheduled_departure", "scheduled_departure")
                        .field("status", "status"),
                ),
        )
}

/// booking → tickets where the source already aggregated tickets into one column.
#[must_use]
pub fn booking_fold_pregrouped() -> FoldSpec {
    FoldSpec::keyed("book_ref")
        .field("book_ref", "booking_ref")
        .field("book_date", "booking_date")
        .field("total_amount", "total_amount")
        .composite_children("tickets", "tickets")
}

/// airport → flight summaries, from a flat airport/flight/aircraft join.
#[must_use]
pub fn airport_fold() -> FoldSpec {
    FoldSpec::keyed("airport_code")
        .field("airport_code", "airport_code")
        .field("airport_name", "airport_name")
        .children(
            "flights",
            FoldSpec::unkeyed()
                .field("flight_no", "flight_no")
                .field("scheduled_departure", "departure_time")
                .field("arrival_airport", "arrival_airport")
                .field("model", "aircraft"),
        )
}

#[must_use]
pub fn airport_fold_pregrouped() -> FoldSpec {
    FoldSpec::keyed("airport_code")
        .field("airport_code", "airport_code")
        .field("airport_name", "airport_name")
        .composite_children("flights", "flights")
}

// ═══════════════════════════════════════════════════════════════════════════
// Scored-member composition
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

impl ScoredMember {
    pub fn new(member: impl Into<String>, score: f64) -> Self {
        Self {
            member: member.into(),
            score,
        }
    }
}

pub fn encode_member<S: AsRef<str>>(fields: &[S]) -> String {
    let mut out = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(MEMBER_DELIMITER);
        }
        for c in field.as_ref().chars() {
            if c == MEMBER_DELIMITER || c == MEMBER_ESCAPE {
                out.push(MEMBER_ESCAPE);
            }
            out.push(c);
        }
    }
    out
}

pub fn decode_member(member: &str) -> Result<Vec<String>, TransformErrorKind> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = member.chars();

    while let Some(c) = chars.next() {
        if c == MEMBER_ESCAPE {
            match chars.next() {
                Some(e) if e == MEMBER_DELIMITER || e == MEMBER_ESCAPE => current.push(e),
                Some(e) => {
                    return Err(TransformErrorKind::InvalidMember(format!("unknown escape '\\{e}'")))
                }
                None => return Err(TransformErrorKind::InvalidMember("dangling escape".into())),
            }
        } else if c == MEMBER_DELIMITER {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);
    Ok(fields)
}

/// Compose scored members from flat rows.
///
/// `member_columns` fixes the field order of the encoded member.
pub fn ranked_members(
    rows: &RowSet,
    score_column: &str,
    member_columns: &[&str],
) -> Result<Vec<Result<ScoredMember, TransformError>>, TransformError> {
    let score_idx = column_index(rows, score_column).map_err(|k| TransformError::new("<spec>", k))?;
    let member_idx = member_columns
        .iter()
        .map(|c| column_index(rows, c))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|k| TransformError::new("<spec>", k))?;

    Ok(rows
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            check_width(rows, i)
                .and_then(|()| compose_member(row, score_idx, &member_idx))
                .map_err(|kind| TransformError::new(format!("row {i}"), kind))
        })
        .collect())
}

fn compose_member(row: &[SourceValue], score_idx: usize, member_idx: &[usize]) -> Result<ScoredMember, TransformErrorKind> {
    let score = to_transport(&row[score_idx])?
        .as_f64()
        .ok_or_else(|| TransformErrorKind::Shape("score column is not numeric".into()))?;
    let fields = member_idx
        .iter()
        .map(|&idx| to_transport(&row[idx]).map(|v| transport_text(&v)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ScoredMember::new(encode_member(&fields), score))
}

/// Member field order for ranked tickets; the score column is `amount`.
pub const RANKED_TICKET_COLUMNS: [&str; 5] =
    ["ticket_no", "flight_id", "passenger_name", "flight_no", "scheduled_departure"];
pub const RANKED_TICKET_SCORE: &str = "amount";

/// A ticket-flight pair ranked by price.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedTicket {
    pub ticket_no: String,
    pub flight_id: i64,
    pub passenger_name: String,
    pub flight_no: String,
    pub scheduled_departure: String,
}

impl RankedTicket {
    #[must_use]
    pub fn to_member(&self) -> String {
        let flight_id = self.flight_id.to_string();
        encode_member(&[
            self.ticket_no.as_str(),
            flight_id.as_str(),
            self.passenger_name.as_str(),
            self.flight_no.as_str(),
            self.scheduled_departure.as_str(),
        ])
    }

    pub fn from_member(member: &str) -> Result<Self, TransformError> {
        let unit = |kind| TransformError::new(member, kind);
        let fields = decode_member(member).map_err(unit)?;
        let [ticket_no, flight_id, passenger_name, flight_no, scheduled_departure]: [String; 5] =
            fields.try_into().map_err(|f: Vec<String>| {
                unit(TransformErrorKind::InvalidMember(format!("expected 5 fields, got {}", f.len())))
            })?;
        let flight_id = flight_id.parse().map_err(|_| {
            unit(CoercionError::InvalidNumber { input: flight_id.clone() }.into())
        })?;
        Ok(Self {
            ticket_no,
            flight_id,
            passenger_name,
            flight_no,
            scheduled_departure,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Hash records → typed records
// ═══════════════════════════════════════════════════════════════════════════

fn required<'a>(record: &'a HashRecord, field: &str) -> Result<&'a str, TransformError> {
    record
        .fields
        .get(field)
        .map(String::as_str)
        .ok_or_else(|| TransformError::new(&record.key, TransformErrorKind::MissingField(field.to_string())))
}

fn number<T: std::str::FromStr>(record: &HashRecord, field: &str) -> Result<T, TransformError> {
    let raw = required(record, field)?;
    raw.trim().parse().map_err(|_| {
        TransformError::new(&record.key, CoercionError::InvalidNumber { input: raw.to_string() })
    })
}

/// `book_date` is a calendar date (`YYYY-MM-DD`).
pub fn booking_from_hash(record: &HashRecord) -> Result<BookingRecord, TransformError> {
    Ok(BookingRecord {
        book_ref: required(record, "book_ref")?.to_string(),
        book_date: parse_date(required(record, "book_date")?)
            .map_err(|e| TransformError::new(&record.key, e))?,
        total_amount: number(record, "total_amount")?,
    })
}

/// Timestamps are strict `YYYY-MM-DDTHH:MM:SS`.
pub fn flight_from_hash(record: &HashRecord) -> Result<FlightRecord, TransformError> {
    let timestamp = |field| {
        parse_timestamp(required(record, field)?).map_err(|e| TransformError::new(&record.key, e))
    };
    Ok(FlightRecord {
        flight_id: number(record, "flight_id")?,
        flight_no: required(record, "flight_no")?.to_string(),
        scheduled_departure: timestamp("scheduled_departure")?,
        scheduled_arrival: timestamp("scheduled_arrival")?,
    })
}

/// `contact_data` is kept as structured JSON when it parses as such, else as a string.
pub fn ticket_from_hash(record: &HashRecord) -> Result<TicketRecord, TransformError> {
    let contact = required(record, "contact_data")?;
    let contact_data = match serde_json::from_str::<Value>(contact) {
        Ok(v @ (Value::Object(_) | Value::Array(_))) => v,
        _ => Value::String(contact.to_string()),
    };
    Ok(TicketRecord {
        ticket_no: required(record, "ticket_no")?.to_string(),
        book_ref: required(record, "book_ref")?.to_string(),
        passenger_name: required(record, "passenger_name")?.to_string(),
        contact_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AirportDocument, BookingDocument, FlightStatus};
    use serde_json::json;
    use sqlx::types::BigDecimal;
    use std::str::FromStr;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn text(s: &str) -> SourceValue {
        SourceValue::from(s)
    }

    fn dec(s: &str) -> SourceValue {
        SourceValue::Decimal(BigDecimal::from_str(s).unwrap())
    }

    fn booking_join() -> RowSet {
        let columns = cols(&[
            "book_ref", "book_date", "total_amount", "ticket_no", "passenger_name",
            "flight_no", "departure_airport", "arrival_airport", "scheduled_departure", "status",
        ]);
        let row = |b: &str, t: &str, p: &str, f: &str, dep: &str, arr: &str| {
            vec![
                text(b), text("2017-07-05"), dec("265700.00"), text(t), text(p),
                text(f), text(dep), text(arr), text("2017-07-20T06:00:00"), text("Arrived"),
            ]
        };
        RowSet::new(
            columns,
            vec![
                row("00000F", "0005432000284", "VALERIY TIKHONOV", "PG0402", "DME", "LED"),
                row("000012", "0005432000860", "ALEKSANDR ZHUKOV", "PG0138", "VKO", "KJA"),
                row("00000F", "0005432000284", "VALERIY TIKHONOV", "PG0403", "LED", "DME"),
                row("00000F", "0005432000285", "ANTONINA KUZNECOVA", "PG0402", "DME", "LED"),
            ],
        )
    }

    #[test]
    fn test_flat_fold_groups_by_parent_and_keeps_order() {
        let docs = fold_documents(&booking_fold(), &booking_join()).unwrap();
        assert_eq!(docs.len(), 2);

        let first: BookingDocument = into_typed(docs[0].clone().unwrap()).unwrap();
        assert_eq!(first.booking_ref, "00000F");
        assert_eq!(first.total_amount, 265700.0);
        assert_eq!(first.tickets.len(), 2);
        assert_eq!(first.tickets[0].ticket_no, "0005432000284");
        let legs: Vec<_> = first.tickets[0].flights.iter().map(|f| f.flight_no.as_str()).collect();
        assert_eq!(legs, vec!["PG0402", "PG0403"]);
        assert_eq!(first.tickets[0].flights[0].status, FlightStatus::Arrived);
        assert!(first.tickets[0].contact_data.is_none());

        let second: BookingDocument = into_typed(docs[1].clone().unwrap()).unwrap();
        assert_eq!(second.booking_ref, "000012");
    }

    #[test]
    fn test_pregrouped_composite_column() {
        let rows = RowSet::new(
            cols(&["book_ref", "book_date", "total_amount", "tickets"]),
            vec![vec![
                text("00000F"),
                text("2017-07-05"),
                dec("100.50"),
                SourceValue::Json(json!([
                    {"ticket_no": "1", "passenger": "A", "flights": []},
                    {"ticket_no": "2", "passenger": "B", "flights": []}
                ])),
            ]],
        );
        let docs = fold_documents(&booking_fold_pregrouped(), &rows).unwrap();
        let doc: BookingDocument = into_typed(docs.into_iter().next().unwrap().unwrap()).unwrap();
        assert_eq!(doc.tickets.len(), 2);
        assert_eq!(doc.tickets[1].passenger, "B");
    }

    #[test]
    fn test_composite_shape_error_is_scoped_to_group() {
        let rows = RowSet::new(
            cols(&["book_ref", "book_date", "total_amount", "tickets"]),
            vec![
                vec![text("BAD001"), text("2017-07-05"), dec("1"), SourceValue::Json(json!("oops"))],
                vec![text("GOOD01"), text("2017-07-05"), dec("1"), SourceValue::Json(json!([]))],
            ],
        );
        let docs = fold_documents(&booking_fold_pregrouped(), &rows).unwrap();
        assert_eq!(docs.len(), 2);
        let err = docs[0].clone().unwrap_err();
        assert_eq!(err.unit, "BAD001");
        assert!(matches!(err.kind, TransformErrorKind::Shape(_)));
        assert!(docs[1].is_ok());
    }

    #[test]
    fn test_unsupported_value_fails_only_its_group() {
        let mut rows = booking_join();
        rows.rows[1][2] = SourceValue::Unsupported { type_name: "MONEY".into() };
        let docs = fold_documents(&booking_fold(), &rows).unwrap();
        let errors: Vec<_> = docs.iter().filter_map(|d| d.as_ref().err()).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].unit, "000012");
    }

    #[test]
    fn test_missing_column_fails_whole_input() {
        let rows = RowSet::new(cols(&["book_ref"]), vec![vec![text("00000F")]]);
        let err = fold_documents(&booking_fold(), &rows).unwrap_err();
        assert!(matches!(err.kind, TransformErrorKind::MissingColumn(_)));
    }

    #[test]
    fn test_null_root_key_is_row_error() {
        let mut rows = booking_join();
        rows.rows[3][0] = SourceValue::Null;
        let docs = fold_documents(&booking_fold(), &rows).unwrap();
        assert_eq!(docs.iter().filter(|d| d.is_err()).count(), 1);
        assert_eq!(docs.iter().filter(|d| d.is_ok()).count(), 2);
    }

    #[test]
    fn test_short_row_is_row_error() {
        let mut rows = booking_join();
        rows.rows[2].truncate(1);
        let docs = fold_documents(&booking_fold(), &rows).unwrap();

        let err = docs.iter().find_map(|d| d.as_ref().err()).unwrap();
        assert_eq!(err.unit, "row 2");
        assert_eq!(err.kind, TransformErrorKind::Shape("row has 1 values for 10 columns".into()));
        assert_eq!(docs.iter().filter(|d| d.is_ok()).count(), 2);
    }

    #[test]
    fn test_outer_join_rows_without_children() {
        let rows = RowSet::new(
            cols(&["airport_code", "airport_name", "flight_no", "scheduled_departure", "arrival_airport", "model"]),
            vec![vec![text("UUA"), text("Bugulma"), SourceValue::Null, SourceValue::Null, SourceValue::Null, SourceValue::Null]],
        );
        let docs = fold_documents(&airport_fold(), &rows).unwrap();
        let airport: AirportDocument = into_typed(docs.into_iter().next().unwrap().unwrap()).unwrap();
        assert!(airport.flights.is_empty());
    }

    #[test]
    fn test_encode_escapes_delimiter() {
        let member = encode_member(&["a:b", r"c\d", ""]);
        assert_eq!(member, r"a\:b:c\\d:");
        assert_eq!(decode_member(&member).unwrap(), vec!["a:b", r"c\d", ""]);
    }

    #[test]
    fn test_decode_rejects_bad_escapes() {
        assert!(matches!(decode_member(r"abc\"), Err(TransformErrorKind::InvalidMember(_))));
        assert!(matches!(decode_member(r"a\nb"), Err(TransformErrorKind::InvalidMember(_))));
    }

    #[test]
    fn test_ranked_members_from_rows() {
        let rows = RowSet::new(
            cols(&["ticket_no", "flight_id", "amount", "passenger_name", "flight_no", "scheduled_departure"]),
            vec![
                vec![text("0005432000284"), SourceValue::Int(187662), dec("6200.00"), text("VALERIY TIKHONOV"), text("PG0402"), text("2017-07-20T06:00:00")],
                vec![text("0005432000285"), SourceValue::Int(187662), text("n/a"), text("X"), text("PG0402"), text("2017-07-20T06:00:00")],
            ],
        );
        let members = ranked_members(&rows, RANKED_TICKET_SCORE, &RANKED_TICKET_COLUMNS).unwrap();
        assert_eq!(members.len(), 2);

        let first = members[0].clone().unwrap();
        assert_eq!(first.score, 6200.0);
        let ticket = RankedTicket::from_member(&first.member).unwrap();
        assert_eq!(ticket.flight_id, 187662);
        assert_eq!(ticket.passenger_name, "VALERIY TIKHONOV");
        assert_eq!(ticket.scheduled_departure, "2017-07-20T06:00:00");

        assert_eq!(members[1].clone().unwrap_err().unit, "row 1");
    }

    #[test]
    fn test_ranked_members_skip_ragged_row() {
        let rows = RowSet::new(
            cols(&["ticket_no", "flight_id", "amount", "passenger_name", "flight_no", "scheduled_departure"]),
            vec![
                vec![text("0005432000284")],
                vec![text("0005432000285"), SourceValue::Int(187662), dec("6200.00"), text("X"), text("PG0402"), text("2017-07-20T06:00:00")],
            ],
        );
        let members = ranked_members(&rows, RANKED_TICKET_SCORE, &RANKED_TICKET_COLUMNS).unwrap();

        let err = members[0].clone().unwrap_err();
        assert_eq!(err.unit, "row 0");
        assert!(matches!(err.kind, TransformErrorKind::Shape(_)));
        assert_eq!(members[1].clone().unwrap().score, 6200.0);
    }

    #[test]
    fn test_ranked_ticket_member_with_delimiter_in_name() {
        let ticket = RankedTicket {
            ticket_no: "1".into(),
            flight_id: 7,
            passenger_name: "O:BRIEN".into(),
            flight_no: "PG0001".into(),
            scheduled_departure: "2017-08-01T06:05:00".into(),
        };
        assert_eq!(RankedTicket::from_member(&ticket.to_member()).unwrap(), ticket);
        assert!(RankedTicket::from_member("only:three:fields").is_err());
    }

    fn hash(key: &str, pairs: &[(&str, &str)]) -> HashRecord {
        HashRecord {
            key: key.to_string(),
            fields: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn test_hash_records_parse() {
        let booking = booking_from_hash(&hash(
            "booking:00000F",
            &[("book_ref", "00000F"), ("book_date", "2017-07-05"), ("total_amount", "265700.00")],
        ))
        .unwrap();
        assert_eq!(booking.total_amount, 265700.0);

        let flight = flight_from_hash(&hash(
            "flight:1",
            &[
                ("flight_id", "1"),
                ("flight_no", "PG0405"),
                ("scheduled_departure", "2017-07-16T06:35:00"),
                ("scheduled_arrival", "2017-07-16T07:30:00"),
            ],
        ))
        .unwrap();
        assert_eq!(flight.flight_id, 1);

        let ticket = ticket_from_hash(&hash(
            "ticket:1",
            &[
                ("ticket_no", "0005432000284"),
                ("book_ref", "00000F"),
                ("passenger_name", "VALERIY TIKHONOV"),
                ("contact_data", r#"{"phone": "+70127117011"}"#),
            ],
        ))
        .unwrap();
        assert_eq!(ticket.contact_data["phone"], json!("+70127117011"));
    }

    #[test]
    fn test_hash_record_errors_name_the_key() {
        let err = booking_from_hash(&hash("booking:X", &[("book_ref", "X"), ("book_date", "05.07.2017"), ("total_amount", "1")]))
            .unwrap_err();
        assert_eq!(err.unit, "booking:X");
        assert!(matches!(err.kind, TransformErrorKind::Coercion(CoercionError::InvalidTemporal { .. })));

        let err = flight_from_hash(&hash("flight:2", &[("flight_id", "2")])).unwrap_err();
        assert!(matches!(err.kind, TransformErrorKind::MissingField(_)));

        let ticket = ticket_from_hash(&hash(
            "ticket:2",
            &[("ticket_no", "2"), ("book_ref", "X"), ("passenger_name", "Y"), ("contact_data", "plain text")],
        ))
        .unwrap();
        assert_eq!(ticket.contact_data, json!("plain text"));
    }
}
