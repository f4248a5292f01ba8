// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end pipeline walkthrough on the in-memory backends.
//!
//! Demonstrates:
//! 1. Folding a flat booking join into nested documents and loading them twice
//! 2. Staged migration of cache hash records with a referential rejection
//! 3. Publishing and reading a ranked ticket set
//! 4. Benchmarking source vs. cache reads
//! 5. Querying the loaded documents
//! 6. Displaying collected metrics
//!
//! # Run
//!
//! ```bash
//! cargo run --example pipeline_demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use serde_json::json;
use sqlx::types::BigDecimal;

use cross_store_sync::analytics::InternationalRule;
use cross_store_sync::model::BookingDocument;
use cross_store_sync::pipeline::RANKED_TICKETS_SQL;
use cross_store_sync::storage::memory::{InMemoryCache, InMemoryDocumentStore, InMemorySource};
use cross_store_sync::transform::booking_fold;
use cross_store_sync::{
    publish_ranked_tickets, BenchmarkHarness, BenchmarkQuery, CacheAside, DocumentQueries,
    Pipeline, RangeOrder, RowSet, SourceValue, SyncConfig,
};

const FLAT_BOOKINGS: &str = "SELECT * FROM flat_bookings";

fn text(s: &str) -> SourceValue {
    SourceValue::Text(s.into())
}

fn flat_bookings() -> RowSet {
    let columns = [
        "book_ref", "book_date", "total_amount", "ticket_no", "passenger_name", "contact_data",
        "flight_no", "departure_airport", "arrival_airport", "scheduled_departure", "status",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();

    let departure = |day, h, m| {
        SourceValue::Timestamp(NaiveDate::from_ymd_opt(2017, 7, day).unwrap().and_hms_opt(h, m, 0).unwrap())
    };
    let row = |book: &str, amount: i64, ticket: &str, name: &str, flight: &str, from: &str, to: &str, day| {
        vec![
            text(book),
            departure(5, 0, 12),
            SourceValue::Decimal(BigDecimal::from(amount)),
            text(ticket),
            text(name),
            SourceValue::Json(json!({"phone": "+70127117011"})),
            text(flight),
            text(from),
            text(to),
            departure(day, 6, 35),
            text("Arrived"),
        ]
    };

    RowSet::new(
        columns,
        vec![
            row("00000F", 265_700, "0005435999873", "VALERIY TIKHONOV", "PG0405", "DME", "LED", 16),
            row("00000F", 265_700, "0005435999874", "EVGENIYA ALEKSEEVA", "PG0405", "DME", "LED", 16),
            row("00000F", 265_700, "0005435999874", "EVGENIYA ALEKSEEVA", "PG0552", "LED", "RIX", 18),
            row("000012", 37_900, "0005435839079", "ALEKSANDR RADISHEVSKIY", "PG0138", "DME", "KZN", 25),
            row("000068", 18_100, "0005435630915", "VIKTORIYA IVANOVA", "PG0013", "SVO", "AER", 22),
        ],
    )
}

fn ranked_tickets() -> RowSet {
    let columns = ["ticket_no", "flight_id", "passenger_name", "flight_no", "scheduled_departure", "amount"]
        .iter()
        .map(|c| c.to_string())
        .collect();
    let dep = SourceValue::Timestamp(NaiveDate::from_ymd_opt(2017, 7, 16).unwrap().and_hms_opt(6, 35, 0).unwrap());
    let row = |ticket: &str, id, name: &str, amount: i64| {
        vec![text(ticket), SourceValue::Int(id), text(name), text("PG0405"), dep.clone(), SourceValue::Decimal(BigDecimal::from(amount))]
    };
    RowSet::new(
        columns,
        vec![
            row("0005435999873", 1185, "VALERIY TIKHONOV", 42_100),
            row("0005435999874", 1185, "EVGENIYA ALEKSEEVA", 18_500),
            row("0005435839079", 2042, "ALEKSANDR RADISHEVSKIY", 6_200),
            row("0005435630915", 3120, "VIKTORIYA IVANOVA", 6_200),
        ],
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           cross-store-sync: Pipeline Demo                     ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    let config = SyncConfig {
        cache_prefix: "demo:".into(),
        cache_ttl_secs: 300,
        load_concurrency: 4,
        ..Default::default()
    };

    let source = Arc::new(
        InMemorySource::new()
            .with_latency(Duration::from_millis(15))
            .with_result(FLAT_BOOKINGS, flat_bookings())
            .with_result(RANKED_TICKETS_SQL, ranked_tickets()),
    );
    let store = Arc::new(InMemoryDocumentStore::new());
    let cache_store = Arc::new(InMemoryCache::new());
    let pipeline = Pipeline::new(Arc::clone(&store), &config);

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Nested migration, twice
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Migrating flat booking join into nested documents...");
    for run in 1..=2 {
        let summary = pipeline
            .migrate_documents::<BookingDocument, _>(source.as_ref(), "flat_bookings", FLAT_BOOKINGS, &[], &booking_fold())
            .await?;
        println!(
            "   run {}: inserted={} skipped_duplicate={} failed={}",
            run, summary.inserted, summary.skipped_duplicate, summary.failed
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Hash records with one orphan ticket
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔗 Migrating cache hash records...");
    cache_store.put_hash(
        "booking:0000A1",
        [("book_ref", "0000A1"), ("book_date", "2017-08-01"), ("total_amount", "12400.00")],
    );
    cache_store.put_hash(
        "ticket:0005432000001",
        [
            ("ticket_no", "0005432000001"),
            ("book_ref", "0000A1"),
            ("passenger_name", "IRINA SOKOLOVA"),
            ("contact_data", "{\"email\": \"i.sokolova@example.com\"}"),
        ],
    );
    cache_store.put_hash(
        "ticket:0005432000002",
        [
            ("ticket_no", "0005432000002"),
            ("book_ref", "FFFFFF"),
            ("passenger_name", "NO BOOKING"),
            ("contact_data", "+70000000000"),
        ],
    );
    let summary = pipeline.migrate_hash_records(cache_store.as_ref()).await?;
    for entity in summary.entities() {
        println!(
            "   {:<8} inserted={} skipped={} missing_parent={} failed={}",
            entity.kind, entity.inserted, entity.skipped_duplicate, entity.rejected_missing_parent, entity.failed
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Ranked set
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🏆 Publishing ranked tickets...");
    let cache = CacheAside::new(Arc::clone(&cache_store), &config);
    let written = publish_ranked_tickets(source.as_ref(), &cache, &config.ranked_set_key, 100, config.op_timeout()).await?;
    println!("   {} members written", written);
    for (ticket, score) in cache.top_tickets(&config.ranked_set_key, 3, RangeOrder::Descending).await? {
        println!("   {:>9.2}  {} {} ({})", score, ticket.ticket_no, ticket.passenger_name, ticket.flight_no);
    }
    println!("   cheapest:");
    for (ticket, score) in cache.top_tickets(&config.ranked_set_key, 1, RangeOrder::Ascending).await? {
        println!("   {:>9.2}  {}", score, ticket.ticket_no);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Benchmark
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⏱️  Benchmarking source vs. cache...");
    let query = BenchmarkQuery::new("flat_bookings", FLAT_BOOKINGS, vec![]);
    let harness = BenchmarkHarness::new(Arc::clone(&source), cache.clone(), config.op_timeout());
    for m in harness.run(&[query]).await? {
        println!(
            "   {}: rows={} cold={:?} cache={:?} warm={:?} speedup={}",
            m.query,
            m.rows,
            m.cold,
            m.cache,
            m.warm_source,
            m.speedup_vs_cold.map_or_else(|| "n/a".to_string(), |r| format!("{r:.1}x"))
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Document queries
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Querying loaded documents...");
    let queries = DocumentQueries::new(Arc::clone(&store), &config);
    let rule = InternationalRule::new(["DME", "SVO", "LED", "KZN", "AER"]);
    for s in queries.booking_summaries(&rule).await? {
        println!(
            "   {} year={:?} tickets={} avg={:.2} from={:?}",
            s.booking_ref, s.booking_year, s.total_tickets, s.average_price, s.departure_airports
        );
    }
    let expensive = queries.amount_above(30_000.0, 10).await?;
    println!("   bookings above 30000: {}", expensive.len());

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Metrics:");
    for (key, _, _, value) in snapshotter.snapshot().into_vec() {
        let labels: Vec<String> = key.key().labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let shown = match value {
            DebugValue::Counter(c) => c.to_string(),
            DebugValue::Gauge(g) => format!("{:.1}", g.into_inner()),
            DebugValue::Histogram(h) => format!("{} samples", h.len()),
        };
        println!("   {} {{{}}} = {}", key.key().name(), labels.join(","), shown);
    }

    println!("\n✅ Done\n");
    Ok(())
}
