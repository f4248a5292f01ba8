// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Extraction → transform → load runs.
//!
//! # Staged load
//!
//! Bookings, flights and tickets land in disjoint collections, so bookings and
//! flights load concurrently. Tickets reference bookings and wait on an
//! explicit completion signal from the booking task:
//!
//! ```text
//!   bookings ──────────────┐ done
//!                          ▼
//!   tickets  ········ wait ──────────► load
//!
//!   flights  ─────────────────────────►
//! ```
//!
//! If the booking stage aborts, the ticket stage is skipped: every ticket
//! would otherwise race against a half-loaded parent collection. The flight
//! stage keeps whatever it committed.
//!
//! # Flows
//!
//! - [`Pipeline::migrate_bookings`] / [`Pipeline::migrate_airports`]: relational
//!   source → nested documents → document store.
//! - [`Pipeline::migrate_hash_records`]: cache hashes (`booking:*`, `flight:*`,
//!   `ticket:*`) → typed records → document store, staged as above.
//! - [`publish_ranked_tickets`]: relational source → scored members → ranked set.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::CacheAside;
use crate::config::SyncConfig;
use crate::error::{PipelineError, TransformError};
use crate::extract::{extract, hash_records, HashRecord};
use crate::load::{EntityKind, EntitySummary, IdempotentLoader, Loadable, LoadSummary};
use crate::metrics;
use crate::model::{AirportDocument, BookingDocument, BookingRecord, FlightRecord, TicketRecord};
use crate::storage::traits::{CacheStore, DocumentStore, QueryParam, RelationalSource};
use crate::transform::{
    airport_fold_pregrouped, booking_fold_pregrouped, booking_from_hash, flight_from_hash,
    fold_documents, into_typed, ranked_members, ticket_from_hash, FoldSpec, ScoredMember,
    RANKED_TICKET_COLUMNS, RANKED_TICKET_SCORE,
};

/// Bookings with tickets and flight segments pre-aggregated by the source.
pub const NESTED_BOOKINGS_SQL: &str = r"
SELECT b.book_ref, b.book_date, b.total_amount,
       jsonb_agg(jsonb_build_object(
           'ticket_no', t.ticket_no,
           'passenger', t.passenger_name,
           'flights', tf.flight_data
       ) ORDER BY t.ticket_no) AS tickets
FROM bookings b
JOIN tickets t ON b.book_ref = t.book_ref
JOIN (
    SELECT tf.ticket_no,
           jsonb_agg(jsonb_build_object(
               'flight_no', f.flight_no,
               'departure_airport', f.departure_airport,
               'arrival_airport', f.arrival_airport,
               'scheduled_departure', f.scheduled_departure,
               'status', f.status
           ) ORDER BY f.scheduled_departure) AS flight_data
    FROM ticket_flights tf
    JOIN flights f ON tf.flight_id = f.flight_id
    GROUP BY tf.ticket_no
) tf ON t.ticket_no = tf.ticket_no
GROUP BY b.book_ref
ORDER BY b.book_ref
LIMIT $1";

/// Airports with their departing flights pre-aggregated.
pub const AIRPORT_FLIGHTS_SQL: &str = r"
SELECT a.airport_code, a.airport_name,
       jsonb_agg(jsonb_build_object(
           'flight_no', f.flight_no,
           'departure_time', f.scheduled_departure,
           'arrival_airport', f.arrival_airport,
           'aircraft', ac.model
       ) ORDER BY f.scheduled_departure) AS flights
FROM airports a
JOIN flights f ON a.airport_code = f.departure_airport
JOIN aircrafts ac ON f.aircraft_code = ac.aircraft_code
GROUP BY a.airport_code, a.airport_name
ORDER BY a.airport_code
LIMIT $1";

/// A random sample of priced ticket-flight pairs.
pub const RANKED_TICKETS_SQL: &str = r"
SELECT tf.ticket_no, tf.flight_id, tf.amount,
       t.passenger_name, f.flight_no, f.scheduled_departure
FROM ticket_flights tf
JOIN tickets t ON tf.ticket_no = t.ticket_no
JOIN flights f ON tf.flight_id = f.flight_id
ORDER BY RANDOM()
LIMIT $1";

pub struct Pipeline<D: ?Sized> {
    loader: IdempotentLoader<D>,
    timeout: Duration,
    extract_limit: i64,
}

impl<D: DocumentStore + ?Sized + 'static> Pipeline<D> {
    pub fn new(store: Arc<D>, config: &SyncConfig) -> Self {
        Self {
            loader: IdempotentLoader::new(store, config),
            timeout: config.op_timeout(),
            extract_limit: config.extract_limit,
        }
    }

    #[must_use]
    pub fn loader(&self) -> &IdempotentLoader<D> {
        &self.loader
    }

    /// Load bookings and flights concurrently, then tickets once bookings finish.
    pub async fn run_staged(
        &self,
        bookings: Vec<Result<BookingRecord, TransformError>>,
        flights: Vec<Result<FlightRecord, TransformError>>,
        tickets: Vec<Result<TicketRecord, TransformError>>,
    ) -> Result<LoadSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("staged_load", %run_id);
        let (bookings_done, bookings_settled) = oneshot::channel::<bool>();

        let loader = self.loader.clone();
        let booking_task = tokio::spawn(async move {
            let result = loader.load_results(bookings).await;
            // Receiver may already be gone if the run was cancelled.
            let _ = bookings_done.send(result.is_ok());
            result
        }
        .instrument(span.clone()));

        let loader = self.loader.clone();
        let flight_task = tokio::spawn(async move { loader.load_results(flights).await }.instrument(span.clone()));

        let loader = self.loader.clone();
        let ticket_task = tokio::spawn(async move {
            match bookings_settled.await {
                Ok(true) => Some(loader.load_results(tickets).await),
                _ => None,
            }
        }
        .instrument(span));

        let mut summary = LoadSummary::new();
        let mut abort_reason: Option<String> = None;

        // Every stage settles before any result is inspected.
        let (booked, flown, ticketed) = tokio::join!(booking_task, flight_task, ticket_task);

        absorb(&mut summary, &mut abort_reason, joined(booked))?;
        absorb(&mut summary, &mut abort_reason, joined(flown))?;
        match ticketed.map_err(task_failed)? {
            Some(result) => absorb(&mut summary, &mut abort_reason, result)?,
            None => {
                warn!(%run_id, "Booking stage did not complete; ticket stage skipped");
                let mut skipped = EntitySummary::new(EntityKind::Ticket);
                skipped.aborted = Some("booking stage did not complete".into());
                summary.add(skipped);
                abort_reason.get_or_insert_with(|| "booking stage did not complete".into());
            }
        }

        if let Some(reason) = abort_reason {
            return Err(PipelineError::BatchAborted {
                summary: Box::new(summary),
                reason,
            });
        }

        info!(
            %run_id,
            inserted = summary.inserted(),
            skipped_duplicate = summary.skipped_duplicate(),
            errors = summary.errors(),
            "Staged load complete"
        );
        Ok(summary)
    }

    /// Extract, fold into documents of type `T`, and load.
    pub async fn migrate_documents<T, S>(
        &self,
        source: &S,
        name: &str,
        query: &str,
        params: &[QueryParam],
        spec: &FoldSpec,
    ) -> Result<EntitySummary, PipelineError>
    where
        T: Loadable + DeserializeOwned,
        S: RelationalSource + ?Sized,
    {
        let extraction = extract(source, name, query, params, self.timeout).await?;
        let folded = fold_documents(spec, &extraction.rows)?;

        let documents: Vec<Result<T, TransformError>> = folded
            .into_iter()
            .map(|doc| doc.and_then(into_typed::<T>))
            .inspect(|doc| {
                if doc.is_err() {
                    metrics::record_transform_error("nested_fold");
                }
            })
            .collect();

        self.loader.load_results(documents).await
    }

    pub async fn migrate_bookings<S: RelationalSource + ?Sized>(&self, source: &S) -> Result<EntitySummary, PipelineError> {
        self.migrate_documents::<BookingDocument, S>(
            source,
            "nested_bookings",
            NESTED_BOOKINGS_SQL,
            &[QueryParam::Int(self.extract_limit)],
            &booking_fold_pregrouped(),
        )
        .await
    }

    pub async fn migrate_airports<S: RelationalSource + ?Sized>(&self, source: &S) -> Result<EntitySummary, PipelineError> {
        self.migrate_documents::<AirportDocument, S>(
            source,
            "airport_flights",
            AIRPORT_FLIGHTS_SQL,
            &[QueryParam::Int(self.extract_limit)],
            &airport_fold_pregrouped(),
        )
        .await
    }

    /// Move `booking:*`, `flight:*` and `ticket:*` hashes into the document store.
    pub async fn migrate_hash_records<C: CacheStore + ?Sized>(&self, cache: &C) -> Result<LoadSummary, PipelineError> {
        let bookings = hash_records(cache, "booking:*", self.timeout).await?;
        let flights = hash_records(cache, "flight:*", self.timeout).await?;
        let tickets = hash_records(cache, "ticket:*", self.timeout).await?;

        self.run_staged(
            parse_all(&bookings, booking_from_hash),
            parse_all(&flights, flight_from_hash),
            parse_all(&tickets, ticket_from_hash),
        )
        .await
    }
}

/// Replace the ranked set at `set_key` with a fresh sample of priced tickets.
///
/// Returns the number of members written. Rows that cannot be composed are
/// logged and left out.
pub async fn publish_ranked_tickets<S, C>(
    source: &S,
    cache: &CacheAside<C>,
    set_key: &str,
    limit: i64,
    timeout: Duration,
) -> Result<usize, PipelineError>
where
    S: RelationalSource + ?Sized,
    C: CacheStore + ?Sized,
{
    let extraction = extract(source, "ranked_tickets", RANKED_TICKETS_SQL, &[QueryParam::Int(limit)], timeout).await?;
    let members: Vec<ScoredMember> = ranked_members(&extraction.rows, RANKED_TICKET_SCORE, &RANKED_TICKET_COLUMNS)?
        .into_iter()
        .filter_map(|member| match member {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(unit = %e.unit, error = %e.kind, "Skipping unrankable row");
                metrics::record_transform_error("scored_member");
                None
            }
        })
        .collect();

    cache.replace_ranked_set(set_key, &members).await?;
    Ok(members.len())
}

fn parse_all<T>(
    records: &[HashRecord],
    parse: fn(&HashRecord) -> Result<T, TransformError>,
) -> Vec<Result<T, TransformError>> {
    records
        .iter()
        .map(|record| {
            let parsed = parse(record);
            if parsed.is_err() {
                metrics::record_transform_error("hash_record");
            }
            parsed
        })
        .collect()
}

fn task_failed(e: JoinError) -> PipelineError {
    PipelineError::TargetUnavailable(format!("load task failed: {e}"))
}

fn joined<T>(result: Result<Result<T, PipelineError>, JoinError>) -> Result<T, PipelineError> {
    result.map_err(task_failed)?
}

/// Fold one stage's result into the run summary, remembering the first abort.
fn absorb(
    summary: &mut LoadSummary,
    abort_reason: &mut Option<String>,
    result: Result<EntitySummary, PipelineError>,
) -> Result<(), PipelineError> {
    match result {
        Ok(stage) => {
            summary.add(stage);
            Ok(())
        }
        Err(PipelineError::BatchAborted { summary: partial, reason }) => {
            summary.merge(*partial);
            abort_reason.get_or_insert(reason);
            Ok(())
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryDocumentStore;
    use crate::storage::traits::{Document, DocumentFilter, InsertOutcome, StorageError};
    use chrono::NaiveDate;
    use serde_json::json;

    fn booking(r: &str) -> Result<BookingRecord, TransformError> {
        Ok(BookingRecord {
            book_ref: r.into(),
            book_date: NaiveDate::from_ymd_opt(2017, 7, 5).unwrap(),
            total_amount: 500.0,
        })
    }

    fn ticket(no: &str, r: &str) -> Result<TicketRecord, TransformError> {
        Ok(TicketRecord {
            ticket_no: no.into(),
            book_ref: r.into(),
            passenger_name: "ANTONINA KUZNECOVA".into(),
            contact_data: json!({}),
        })
    }

    fn flight(id: i64) -> Result<FlightRecord, TransformError> {
        let dep = NaiveDate::from_ymd_opt(2017, 7, 16).unwrap().and_hms_opt(6, 35, 0).unwrap();
        Ok(FlightRecord {
            flight_id: id,
            flight_no: "PG0405".into(),
            scheduled_departure: dep,
            scheduled_arrival: dep + chrono::TimeDelta::minutes(55),
        })
    }

    #[tokio::test]
    async fn test_tickets_see_bookings_loaded_in_same_run() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let pipeline = Pipeline::new(Arc::clone(&store), &SyncConfig::default());

        // Every ticket's parent arrives in the same run; the barrier must hold.
        let bookings: Vec<_> = (0..20).map(|i| booking(&format!("B{i:05}"))).collect();
        let tickets: Vec<_> = (0..20).map(|i| ticket(&format!("T{i}"), &format!("B{i:05}"))).collect();

        let summary = pipeline
            .run_staged(bookings, vec![flight(1), flight(2)], tickets)
            .await
            .unwrap();

        assert_eq!(summary.entity(EntityKind::Booking).unwrap().inserted, 20);
        assert_eq!(summary.entity(EntityKind::Flight).unwrap().inserted, 2);
        let tickets = summary.entity(EntityKind::Ticket).unwrap();
        assert_eq!(tickets.inserted, 20);
        assert_eq!(tickets.rejected_missing_parent, 0);
    }

    #[tokio::test]
    async fn test_booking_abort_skips_ticket_stage() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.set_available(false);
        let pipeline = Pipeline::new(Arc::clone(&store), &SyncConfig::default());

        let err = pipeline
            .run_staged(vec![booking("B00001")], vec![], vec![ticket("T1", "B00001")])
            .await
            .unwrap_err();

        let partial = err.partial_summary().unwrap();
        assert!(partial.entity(EntityKind::Booking).unwrap().aborted.is_some());
        let tickets = partial.entity(EntityKind::Ticket).unwrap();
        assert_eq!(tickets.processed(), 0);
        assert!(tickets.aborted.is_some());
    }

    /// Crashes on any booking lookup; flight writes are slow.
    struct CrashingStore {
        inner: InMemoryDocumentStore,
    }

    #[async_trait::async_trait]
    impl DocumentStore for CrashingStore {
        async fn find(&self, collection: &str, filter: &DocumentFilter) -> Result<Vec<Document>, StorageError> {
            self.inner.find(collection, filter).await
        }

        async fn exists(&self, collection: &str, key: &str) -> Result<bool, StorageError> {
            if collection == "bookings" {
                panic!("booking lookup crashed");
            }
            self.inner.exists(collection, key).await
        }

        async fn insert_one(&self, collection: &str, key: &str, doc: &Document) -> Result<InsertOutcome, StorageError> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.inner.insert_one(collection, key, doc).await
        }
    }

    #[tokio::test]
    async fn test_crashed_stage_waits_for_other_stages() {
        let store = Arc::new(CrashingStore { inner: InMemoryDocumentStore::new() });
        let pipeline = Pipeline::new(Arc::clone(&store), &SyncConfig::default());

        let err = pipeline
            .run_staged(vec![booking("B00001")], vec![flight(1), flight(2), flight(3)], vec![ticket("T1", "B00001")])
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::TargetUnavailable(_)));
        // The flight stage finished before the run returned.
        assert_eq!(store.inner.len("flights"), 3);
        assert_eq!(store.inner.len("tickets"), 0);
    }

    #[test]
    fn test_queries_are_parameterized() {
        for sql in [NESTED_BOOKINGS_SQL, AIRPORT_FLIGHTS_SQL, RANKED_TICKETS_SQL] {
            assert!(sql.trim_end().ends_with("LIMIT $1"));
        }
    }
}
