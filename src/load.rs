// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Idempotent load into the document store.
//!
//! Each record walks a small state machine:
//!
//! ```text
//! pending ──exists?──► checked ──┬─► skipped-duplicate   (key already present)
//!                                ├─► rejected-missing-parent
//!                                ├─► inserted
//!                                └─► failed              (store rejected the write)
//! ```
//!
//! The final write is the store's conditional insert, so two loaders racing on
//! the same key both end in a terminal state without clobbering each other:
//! the loser observes `AlreadyPresent` and counts a duplicate.
//!
//! Records within one entity load run on a bounded pool
//! (`buffer_unordered`); outcomes flow back to a single aggregator, so the
//! counters need no synchronization.
//!
//! A connectivity failure ([`StorageError::is_fatal`]) stops the batch: no new
//! records start, those already in flight finish and are counted. The caller
//! receives [`PipelineError::BatchAborted`] holding every counted outcome.
//!
//! When the store's `bulk_insert` is all-or-nothing
//! ([`DocumentStore::atomic_bulk_insert`]), the pool only runs the checks and
//! the surviving records are written together at the end. An aborted batch
//! then commits no inserts at all.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{PipelineError, TransformError};
use crate::metrics;
use crate::resilience::timeout::with_timeout;
use crate::storage::traits::{Document, DocumentStore, InsertOutcome, StorageError};

/// Target collections, one per entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EntityKind {
    Booking,
    Ticket,
    Flight,
    Airport,
}

impl EntityKind {
    #[must_use]
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Booking => "bookings",
            Self::Ticket => "tickets",
            Self::Flight => "flights",
            Self::Airport => "airports",
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Booking => "booking",
            Self::Ticket => "ticket",
            Self::Flight => "flight",
            Self::Airport => "airport",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A required reference to a record in another collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub collection: &'static str,
    pub key: String,
}

/// Something the loader can write: serializable, with a natural key.
pub trait Loadable: Serialize + Send + Sync {
    const KIND: EntityKind;

    fn natural_key(&self) -> String;

    /// Parent that must already exist in the target before this record is written.
    fn parent(&self) -> Option<ParentRef> {
        None
    }
}

/// Terminal state of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Inserted,
    SkippedDuplicate,
    RejectedMissingParent { parent: ParentRef },
    Failed { reason: String },
}

impl LoadOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::SkippedDuplicate => "skipped_duplicate",
            Self::RejectedMissingParent { .. } => "rejected_missing_parent",
            Self::Failed { .. } => "failed",
        }
    }

    /// Counted against the error total.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::RejectedMissingParent { .. } | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecord {
    pub key: String,
    pub reason: String,
}

/// Outcome counters for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySummary {
    pub kind: EntityKind,
    pub inserted: usize,
    pub skipped_duplicate: usize,
    pub rejected_missing_parent: usize,
    pub failed: usize,
    /// Every record that ended in an error state, with the reason.
    pub failures: Vec<FailedRecord>,
    /// Set when the batch stopped early on a connectivity failure.
    pub aborted: Option<String>,
}

impl EntitySummary {
    #[must_use]
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            inserted: 0,
            skipped_duplicate: 0,
            rejected_missing_parent: 0,
            failed: 0,
            failures: Vec::new(),
            aborted: None,
        }
    }

    pub fn record(&mut self, key: String, outcome: &LoadOutcome) {
        metrics::record_load_outcome(self.kind.label(), outcome.label());
        match outcome {
            LoadOutcome::Inserted => self.inserted += 1,
            LoadOutcome::SkippedDuplicate => self.skipped_duplicate += 1,
            LoadOutcome::RejectedMissingParent { parent } => {
                self.rejected_missing_parent += 1;
                self.failures.push(FailedRecord {
                    key,
                    reason: format!("missing parent {}/{}", parent.collection, parent.key),
                });
            }
            LoadOutcome::Failed { reason } => {
                self.failed += 1;
                self.failures.push(FailedRecord {
                    key,
                    reason: reason.clone(),
                });
            }
        }
    }

    #[must_use]
    pub fn errors(&self) -> usize {
        self.rejected_missing_parent + self.failed
    }

    #[must_use]
    pub fn processed(&self) -> usize {
        self.inserted + self.skipped_duplicate + self.errors()
    }

    fn absorb(&mut self, other: EntitySummary) {
        self.inserted += other.inserted;
        self.skipped_duplicate += other.skipped_duplicate;
        self.rejected_missing_parent += other.rejected_missing_parent;
        self.failed += other.failed;
        self.failures.extend(other.failures);
        if self.aborted.is_none() {
            self.aborted = other.aborted;
        }
    }
}

/// Per-entity summaries for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    entities: BTreeMap<EntityKind, EntitySummary>,
}

impl LoadSummary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entity(&self, kind: EntityKind) -> Option<&EntitySummary> {
        self.entities.get(&kind)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntitySummary> {
        self.entities.values()
    }

    /// Add an entity summary, merging with any existing one of the same kind.
    pub fn add(&mut self, summary: EntitySummary) {
        match self.entities.get_mut(&summary.kind) {
            Some(existing) => existing.absorb(summary),
            None => {
                self.entities.insert(summary.kind, summary);
            }
        }
    }

    pub fn merge(&mut self, other: LoadSummary) {
        for summary in other.entities.into_values() {
            self.add(summary);
        }
    }

    #[must_use]
    pub fn inserted(&self) -> usize {
        self.entities.values().map(|e| e.inserted).sum()
    }

    #[must_use]
    pub fn skipped_duplicate(&self) -> usize {
        self.entities.values().map(|e| e.skipped_duplicate).sum()
    }

    #[must_use]
    pub fn errors(&self) -> usize {
        self.entities.values().map(EntitySummary::errors).sum()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.entities.values().any(|e| e.aborted.is_some())
    }
}

impl From<EntitySummary> for LoadSummary {
    fn from(summary: EntitySummary) -> Self {
        let mut s = Self::new();
        s.add(summary);
        s
    }
}

/// Loads typed records into a [`DocumentStore`] with skip-on-duplicate semantics.
pub struct IdempotentLoader<D: ?Sized> {
    store: Arc<D>,
    concurrency: usize,
    timeout: Duration,
}

impl<D: ?Sized> Clone for IdempotentLoader<D> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            concurrency: self.concurrency,
            timeout: self.timeout,
        }
    }
}

impl<D: DocumentStore + ?Sized> IdempotentLoader<D> {
    pub fn new(store: Arc<D>, config: &SyncConfig) -> Self {
        Self {
            store,
            concurrency: config.load_concurrency.max(1),
            timeout: config.op_timeout(),
        }
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<D> {
        &self.store
    }

    /// Load every record, returning the per-outcome summary.
    ///
    /// Only a connectivity failure ends the batch early, as
    /// [`PipelineError::BatchAborted`].
    pub async fn load_batch<T: Loadable>(&self, records: Vec<T>) -> Result<EntitySummary, PipelineError> {
        self.load_results(records.into_iter().map(Ok).collect()).await
    }

    /// Like [`load_batch`](Self::load_batch), but accepts the per-unit output of
    /// a transformation. Failed units are counted as `failed` and skipped.
    pub async fn load_results<T: Loadable>(
        &self,
        records: Vec<Result<T, TransformError>>,
    ) -> Result<EntitySummary, PipelineError> {
        let kind = T::KIND;
        let mut summary = EntitySummary::new(kind);
        let mut ready = Vec::with_capacity(records.len());

        for record in records {
            match record {
                Ok(r) => ready.push(r),
                Err(e) => {
                    warn!(entity = %kind, unit = %e.unit, error = %e.kind, "Skipping untransformable record");
                    summary.record(e.unit, &LoadOutcome::Failed { reason: e.kind.to_string() });
                }
            }
        }

        let atomic = self.store.atomic_bulk_insert();
        let halted = Arc::new(AtomicBool::new(false));
        let mut staged: Vec<(String, Document)> = Vec::new();
        let mut abort: Option<String> = None;

        let mut outcomes = stream::iter(ready.into_iter().map(|record| {
            let loader = self.clone();
            let halted = Arc::clone(&halted);
            async move {
                let key = record.natural_key();
                if halted.load(Ordering::Acquire) {
                    return (key, None);
                }
                let step = if atomic {
                    settle(loader.check(&record).await)
                } else {
                    settle(loader.try_load(&record).await).map(Checked::Settled)
                };
                (key, Some(step))
            }
        }))
        .buffer_unordered(self.concurrency);

        // After a fatal error, records already in flight still report in.
        while let Some((key, step)) = outcomes.next().await {
            match step {
                None => {}
                Some(Ok(Checked::Settled(outcome))) => {
                    if outcome.is_error() {
                        warn!(entity = %kind, key = %key, outcome = outcome.label(), "Record not loaded");
                    }
                    summary.record(key, &outcome);
                }
                Some(Ok(Checked::Ready(doc))) => staged.push((key, doc)),
                Some(Err(e)) => {
                    if abort.is_none() {
                        warn!(entity = %kind, key = %key, error = %e, "Connectivity lost, aborting batch");
                        halted.store(true, Ordering::Release);
                        abort = Some(e.to_string());
                    }
                }
            }
        }
        drop(outcomes);

        if abort.is_none() && !staged.is_empty() {
            abort = self.write_staged(kind, staged, &mut summary).await;
        }

        if let Some(reason) = abort {
            metrics::record_batch_aborted(kind.label());
            summary.aborted = Some(reason.clone());
            return Err(PipelineError::BatchAborted {
                summary: Box::new(summary.into()),
                reason,
            });
        }

        info!(
            entity = %kind,
            inserted = summary.inserted,
            skipped_duplicate = summary.skipped_duplicate,
            rejected_missing_parent = summary.rejected_missing_parent,
            failed = summary.failed,
            "Entity load complete"
        );
        Ok(summary)
    }

    /// Drive one record to a terminal state.
    ///
    /// `Err` is reserved for fatal storage errors; every other failure is
    /// folded into [`LoadOutcome::Failed`].
    pub async fn load_one<T: Loadable>(&self, record: &T) -> Result<LoadOutcome, StorageError> {
        settle(self.try_load(record).await)
    }

    async fn try_load<T: Loadable>(&self, record: &T) -> Result<LoadOutcome, StorageError> {
        match self.check(record).await? {
            Checked::Settled(outcome) => Ok(outcome),
            Checked::Ready(doc) => {
                let key = record.natural_key();
                let written = with_timeout(
                    "document_insert",
                    self.timeout,
                    self.store.insert_one(T::KIND.collection(), &key, &doc),
                )
                .await?;
                Ok(written.into())
            }
        }
    }

    /// Everything up to the write: duplicate check, parent check, serialization.
    async fn check<T: Loadable>(&self, record: &T) -> Result<Checked, StorageError> {
        let collection = T::KIND.collection();
        let key = record.natural_key();

        if with_timeout("document_exists", self.timeout, self.store.exists(collection, &key)).await? {
            return Ok(LoadOutcome::SkippedDuplicate.into());
        }
        debug!(collection, key = %key, "Record checked, not present");

        if let Some(parent) = record.parent() {
            let present = with_timeout(
                "document_parent_exists",
                self.timeout,
                self.store.exists(parent.collection, &parent.key),
            )
            .await?;
            if !present {
                return Ok(LoadOutcome::RejectedMissingParent { parent }.into());
            }
        }

        match serde_json::to_value(record) {
            Ok(Value::Object(doc)) => Ok(Checked::Ready(doc)),
            Ok(_) => Ok(LoadOutcome::Failed {
                reason: "record does not serialize to a mapping".into(),
            }
            .into()),
            Err(e) => Err(StorageError::Serialization(e.to_string())),
        }
    }

    /// Write checked records in one unit of work.
    ///
    /// Returns the abort reason on a fatal error; nothing from the set is
    /// counted then, since the store committed none of it.
    async fn write_staged(
        &self,
        kind: EntityKind,
        staged: Vec<(String, Document)>,
        summary: &mut EntitySummary,
    ) -> Option<String> {
        let written = with_timeout(
            "document_bulk_insert",
            self.timeout,
            self.store.bulk_insert(kind.collection(), &staged),
        )
        .await;

        match written {
            Ok(outcomes) => {
                for ((key, _), outcome) in staged.into_iter().zip(outcomes) {
                    summary.record(key, &LoadOutcome::from(outcome));
                }
                None
            }
            Err(e) if e.is_fatal() => {
                warn!(entity = %kind, records = staged.len(), error = %e, "Batch write rolled back, aborting");
                Some(e.to_string())
            }
            Err(e) => {
                warn!(entity = %kind, records = staged.len(), error = %e, "Batch write rejected");
                let outcome = LoadOutcome::Failed { reason: e.to_string() };
                for (key, _) in staged {
                    summary.record(key, &outcome);
                }
                None
            }
        }
    }
}

/// Result of the checks that precede a write.
enum Checked {
    Settled(LoadOutcome),
    Ready(Document),
}

impl From<LoadOutcome> for Checked {
    fn from(outcome: LoadOutcome) -> Self {
        Self::Settled(outcome)
    }
}

impl From<InsertOutcome> for LoadOutcome {
    fn from(outcome: InsertOutcome) -> Self {
        match outcome {
            InsertOutcome::Inserted => Self::Inserted,
            // Another loader won the race after our check.
            InsertOutcome::AlreadyPresent => Self::SkippedDuplicate,
        }
    }
}

fn settle<T: From<LoadOutcome>>(result: Result<T, StorageError>) -> Result<T, StorageError> {
    match result {
        Err(e) if !e.is_fatal() => Ok(LoadOutcome::Failed { reason: e.to_string() }.into()),
        other => other,
    }
}
