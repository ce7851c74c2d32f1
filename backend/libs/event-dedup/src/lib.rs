//! # Event Deduplication Engine
//!
//! Ingests batches of events keyed by `(topic, event_id)` and guarantees that
//! every key is stored and counted at most once, no matter how often it is
//! retransmitted or how many senders submit it at the same time.
//!
//! ## Architecture
//!
//! ```text
//! raw batch → BatchProcessor ─┬─ validate_event (drop + log invalid)
//!                             ├─ BatchTx::try_insert (per-record savepoint)
//!                             ├─ BatchTx::apply_delta (relative counter add)
//!                             └─ BatchTx::commit (all or nothing)
//!                                      ↓
//!                               EventStore (PostgreSQL / in-memory)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use event_dedup::{BatchProcessor, PgEventStore, EventStore, MIGRATOR};
//! use std::sync::Arc;
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! MIGRATOR.run(&pool).await?;
//! let store = Arc::new(PgEventStore::new(pool));
//! store.ensure_counters().await?;
//!
//! let processor = BatchProcessor::new(store);
//! let summary = processor
//!     .process_batch(&[serde_json::json!({
//!         "topic": "t",
//!         "event_id": "a",
//!         "timestamp": "2024-01-01T00:00:00Z",
//!         "source": "s",
//!         "payload": {}
//!     })])
//!     .await?;
//! assert_eq!(summary.processed_count, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Safety
//!
//! - **10 senders submit the same event**: one insert wins on the unique
//!   constraint, the other 9 see a conflict and report a duplicate.
//! - **Counters**: each batch adds its delta relative to the stored value
//!   inside its own transaction, so concurrent batches never overwrite each
//!   other's totals.
//! - **Failed commit**: inserts and counter delta are discarded together; the
//!   caller can resubmit the batch and already-stored events come back as
//!   duplicates.

pub mod coordinator;
pub mod counters;
mod error;
mod metrics;
pub mod model;
pub mod store;
pub mod validation;

pub use coordinator::BatchProcessor;
pub use counters::{CounterDelta, Counters};
pub use error::{DedupError, DedupResult};
pub use model::{BatchSummary, Event, EventKey, InsertOutcome, StoredEvent};
pub use store::{BatchTx, EventStore, MemoryEventStore, PgEventStore};
pub use validation::{validate_event, ValidationError};

/// Schema for `dedup_events` and `dedup_stats`
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
