//! Batch coordinator: validates, inserts and tallies one batch, then commits
//! the inserts and the counter delta as a single unit.

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::counters::CounterDelta;
use crate::error::{DedupError, DedupResult};
use crate::metrics;
use crate::model::{BatchSummary, InsertOutcome};
use crate::store::{BatchTx, EventStore};
use crate::validation::validate_event;

/// Shared entry point for ingest. Cheap to clone; every clone talks to the
/// same store.
#[derive(Clone)]
pub struct BatchProcessor {
    store: Arc<dyn EventStore>,
}

#[derive(Default)]
struct Tally {
    unique: u64,
    duplicates: u64,
    invalid: u64,
    skipped: u64,
}

impl BatchProcessor {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Process one batch of raw records.
    ///
    /// Invalid records are dropped with a log line and still count towards
    /// `total_received`. Conflicts become the duplicate tally. Only storage
    /// failures are returned, and when they are nothing from this batch is
    /// durable.
    pub async fn process_batch(&self, records: &[Value]) -> DedupResult<BatchSummary> {
        let total_received = records.len() as u64;
        if records.is_empty() {
            return Ok(BatchSummary::empty());
        }

        let started = Instant::now();
        let result = self.run_batch(records).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok((tally, summary)) => {
                metrics::record_batch(true, elapsed);
                metrics::record_outcomes(
                    tally.unique,
                    tally.duplicates,
                    tally.invalid,
                    tally.skipped,
                );
                info!(
                    total_received,
                    processed = summary.processed_count,
                    duplicates = summary.duplicates_skipped,
                    rejected = summary.rejected_count,
                    "Batch committed"
                );
                Ok(summary)
            }
            Err(e) => {
                metrics::record_batch(false, elapsed);
                if e.is_transient() {
                    warn!(
                        total_received,
                        error = %e,
                        "Batch aborted by a transient storage failure, rolled back; safe to resubmit"
                    );
                } else {
                    error!(total_received, error = %e, "Batch failed, rolled back");
                }
                Err(e)
            }
        }
    }

    async fn run_batch(&self, records: &[Value]) -> DedupResult<(Tally, BatchSummary)> {
        let mut tx = self.store.begin_batch().await?;
        let mut tally = Tally::default();
        let mut accepted_keys = Vec::new();

        for (index, raw) in records.iter().enumerate() {
            let event = match validate_event(raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!(index, error = %e, "Dropping invalid event");
                    tally.invalid += 1;
                    continue;
                }
            };

            match tx.try_insert(&event).await {
                Ok(InsertOutcome::Accepted) => {
                    tally.unique += 1;
                    accepted_keys.push(event.key());
                }
                Ok(InsertOutcome::Conflict) => tally.duplicates += 1,
                Err(e) if e.is_record_scoped() => {
                    warn!(
                        index,
                        topic = %event.topic,
                        event_id = %event.event_id,
                        error = %e,
                        "Store rejected event, skipping"
                    );
                    tally.skipped += 1;
                }
                Err(e) => return Err(abort(tx, e).await),
            }
        }

        let total_received = records.len() as u64;
        let delta = CounterDelta::for_batch(total_received, tally.unique, tally.duplicates);
        if let Err(e) = tx.apply_delta(delta).await {
            return Err(abort(tx, e).await);
        }

        // A failed commit leaves nothing behind: the backend discards the
        // whole transaction, inserts included.
        tx.commit().await?;

        let summary = BatchSummary {
            status: "ok".to_string(),
            processed_count: tally.unique,
            duplicates_skipped: tally.duplicates,
            total_received,
            rejected_count: tally.invalid + tally.skipped,
            accepted_keys,
        };
        Ok((tally, summary))
    }
}

async fn abort(tx: Box<dyn BatchTx>, cause: DedupError) -> DedupError {
    if let Err(rollback_err) = tx.rollback().await {
        warn!(error = %rollback_err, "Rollback after batch failure also failed");
    }
    cause
}
