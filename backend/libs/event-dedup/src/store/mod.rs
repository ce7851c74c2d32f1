//! Uniqueness store: the sole arbiter of "is this event new".
//!
//! A batch runs inside one [`BatchTx`]. Every [`BatchTx::try_insert`] is a
//! single conditional write scoped to its own savepoint, so a conflicting or
//! failing record never undoes its siblings. Nothing a batch writes is
//! visible to readers until [`BatchTx::commit`] succeeds; dropping or
//! rolling back the transaction discards all of it, counter delta included.

mod memory;
mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

use async_trait::async_trait;

use crate::counters::{CounterDelta, Counters};
use crate::error::DedupResult;
use crate::model::{Event, InsertOutcome, StoredEvent};

/// Persistent event table plus the singleton counters row.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Open the outer (per-batch) transaction.
    async fn begin_batch(&self) -> DedupResult<Box<dyn BatchTx>>;

    /// Create the counters row with all totals at zero if it is absent.
    ///
    /// Safe to race: the loser observes the existing row. Returns `true`
    /// only for the call that created it.
    async fn ensure_counters(&self) -> DedupResult<bool>;

    /// Current committed totals, `None` before initialization.
    async fn counters(&self) -> DedupResult<Option<Counters>>;

    /// Stored events newest first (event timestamp, then ingest order),
    /// optionally restricted to one topic.
    async fn list_events(&self, topic: Option<&str>, limit: i64)
        -> DedupResult<Vec<StoredEvent>>;

    /// Distinct topics of stored events, sorted. Scans the store.
    async fn distinct_topics(&self) -> DedupResult<Vec<String>>;
}

/// One in-flight batch.
#[async_trait]
pub trait BatchTx: Send {
    /// Atomically insert `event` unless its key already exists.
    async fn try_insert(&mut self, event: &Event) -> DedupResult<InsertOutcome>;

    /// Add `delta` to the counters as part of this batch.
    async fn apply_delta(&mut self, delta: CounterDelta) -> DedupResult<()>;

    /// Make every insert and the counter delta durable together.
    async fn commit(self: Box<Self>) -> DedupResult<()>;

    /// Discard everything this batch wrote.
    async fn rollback(self: Box<Self>) -> DedupResult<()>;
}
