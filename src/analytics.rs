// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queries and aggregations over loaded documents.
//!
//! Booking lookups filter typed [`BookingDocument`]s after a scan of the
//! `bookings` collection; documents of another shape in that collection are
//! skipped. Aggregations are plain functions over typed documents so they can
//! run against any store's output.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Datelike;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::coerce::parse_temporal;
use crate::config::SyncConfig;
use crate::error::PipelineError;
use crate::load::EntityKind;
use crate::model::{AirportDocument, BookingDocument, FlightStatus};
use crate::resilience::timeout::with_timeout;
use crate::storage::traits::{DocumentFilter, DocumentStore};

/// Which airports count as domestic.
///
/// A booking is international when any of its segments departs from or
/// arrives at an airport outside this set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternationalRule {
    domestic: BTreeSet<String>,
}

impl InternationalRule {
    pub fn new<I, S>(domestic: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domestic: domestic.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn is_international(&self, booking: &BookingDocument) -> bool {
        booking.segments().any(|s| {
            !self.domestic.contains(&s.departure_airport) || !self.domestic.contains(&s.arrival_airport)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingSummary {
    pub booking_ref: String,
    /// `None` when the booking date does not parse.
    pub booking_year: Option<i32>,
    pub total_tickets: usize,
    pub average_price: f64,
    /// Distinct, sorted.
    pub departure_airports: Vec<String>,
    pub international: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AircraftRanking {
    pub model: String,
    pub total_flights: usize,
    /// Distinct airport codes, in first-seen order.
    pub airports: Vec<String>,
    pub last_flight: String,
}

/// Multi-ticket international bookings, by average ticket price (highest first).
#[must_use]
pub fn summarize_bookings(bookings: &[BookingDocument], rule: &InternationalRule) -> Vec<BookingSummary> {
    let mut summaries: Vec<BookingSummary> = bookings
        .iter()
        .filter(|b| b.tickets.len() > 1)
        .map(|b| BookingSummary {
            booking_ref: b.booking_ref.clone(),
            booking_year: parse_temporal(&b.booking_date).ok().map(|d| d.year()),
            total_tickets: b.tickets.len(),
            average_price: b.total_amount / b.tickets.len() as f64,
            departure_airports: b
                .segments()
                .map(|s| s.departure_airport.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            international: rule.is_international(b),
        })
        .filter(|s| s.international)
        .collect();

    summaries.sort_by(|a, b| {
        b.average_price
            .total_cmp(&a.average_price)
            .then_with(|| a.booking_ref.cmp(&b.booking_ref))
    });
    summaries
}

/// Aircraft models by number of departing flights, ties by model name.
#[must_use]
pub fn rank_aircraft(airports: &[AirportDocument], limit: usize) -> Vec<AircraftRanking> {
    let mut by_model: Vec<AircraftRanking> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for airport in airports {
        for flight in &airport.flights {
            let pos = *index.entry(flight.aircraft.as_str()).or_insert_with(|| {
                by_model.push(AircraftRanking {
                    model: flight.aircraft.clone(),
                    total_flights: 0,
                    airports: Vec::new(),
                    last_flight: String::new(),
                });
                by_model.len() - 1
            });
            let entry = &mut by_model[pos];
            entry.total_flights += 1;
            if !entry.airports.contains(&airport.airport_code) {
                entry.airports.push(airport.airport_code.clone());
            }
            entry.last_flight.clone_from(&flight.flight_no);
        }
    }

    by_model.sort_by(|a, b| b.total_flights.cmp(&a.total_flights).then_with(|| a.model.cmp(&b.model)));
    by_model.truncate(limit);
    by_model
}

/// Read-side access to the loaded booking and airport documents.
pub struct DocumentQueries<D: ?Sized> {
    store: Arc<D>,
    timeout: Duration,
}

impl<D: DocumentStore + ?Sized> DocumentQueries<D> {
    pub fn new(store: Arc<D>, config: &SyncConfig) -> Self {
        Self {
            store,
            timeout: config.op_timeout(),
        }
    }

    async fn typed<T: DeserializeOwned>(&self, kind: EntityKind, filter: &DocumentFilter) -> Result<Vec<T>, PipelineError> {
        let docs = with_timeout("document_find", self.timeout, self.store.find(kind.collection(), filter))
            .await
            .map_err(PipelineError::target)?;
        let total = docs.len();
        let typed: Vec<T> = docs
            .into_iter()
            .filter_map(|doc| serde_json::from_value(Value::Object(doc)).ok())
            .collect();
        if typed.len() < total {
            debug!(collection = kind.collection(), skipped = total - typed.len(), "Skipped documents of another shape");
        }
        Ok(typed)
    }

    pub async fn bookings(&self) -> Result<Vec<BookingDocument>, PipelineError> {
        self.typed(EntityKind::Booking, &DocumentFilter::All).await
    }

    pub async fn airports(&self) -> Result<Vec<AirportDocument>, PipelineError> {
        self.typed(EntityKind::Airport, &DocumentFilter::All).await
    }

    pub async fn find_booking(&self, booking_ref: &str) -> Result<Option<BookingDocument>, PipelineError> {
        let found = self
            .typed(EntityKind::Booking, &DocumentFilter::Key(booking_ref.to_string()))
            .await?;
        Ok(found.into_iter().next())
    }

    pub async fn amount_above(&self, threshold: f64, limit: usize) -> Result<Vec<BookingDocument>, PipelineError> {
        Ok(self
            .bookings()
            .await?
            .into_iter()
            .filter(|b| b.total_amount > threshold)
            .take(limit)
            .collect())
    }

    /// Bookings with at least one segment matching both flight number and status.
    pub async fn with_segment(&self, flight_no: &str, status: FlightStatus) -> Result<Vec<BookingDocument>, PipelineError> {
        Ok(self
            .bookings()
            .await?
            .into_iter()
            .filter(|b| b.segments().any(|s| s.flight_no == flight_no && s.status == status))
            .collect())
    }

    /// Case-insensitive passenger name prefix.
    pub async fn passenger_prefix(&self, prefix: &str) -> Result<Vec<BookingDocument>, PipelineError> {
        let prefix = prefix.to_lowercase();
        Ok(self
            .bookings()
            .await?
            .into_iter()
            .filter(|b| b.tickets.iter().any(|t| t.passenger.to_lowercase().starts_with(&prefix)))
            .collect())
    }

    /// Amount within `[min, max]` and at least one departure from `airports`.
    pub async fn amount_range_from_airports(
        &self,
        min: f64,
        max: f64,
        airports: &[&str],
    ) -> Result<Vec<BookingDocument>, PipelineError> {
        Ok(self
            .bookings()
            .await?
            .into_iter()
            .filter(|b| b.total_amount >= min && b.total_amount <= max)
            .filter(|b| b.segments().any(|s| airports.contains(&s.departure_airport.as_str())))
            .collect())
    }

    pub async fn booking_summaries(&self, rule: &InternationalRule) -> Result<Vec<BookingSummary>, PipelineError> {
        Ok(summarize_bookings(&self.bookings().await?, rule))
    }

    pub async fn aircraft_ranking(&self, limit: usize) -> Result<Vec<AircraftRanking>, PipelineError> {
        Ok(rank_aircraft(&self.airports().await?, limit))
    }
}
