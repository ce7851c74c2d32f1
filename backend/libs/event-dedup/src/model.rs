use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A validated event, ready to be offered to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub event_id: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    /// The deduplication key
    pub fn key(&self) -> EventKey {
        EventKey {
            topic: self.topic.clone(),
            event_id: self.event_id.clone(),
        }
    }
}

/// `(topic, event_id)`, unique across all stored events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub topic: String,
    pub event_id: String,
}

/// An event as persisted: the canonical copy for its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Monotonic ingest sequence assigned by the store
    pub id: i64,
    pub topic: String,
    pub event_id: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Outcome of a single conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The candidate is now the stored copy for its key
    Accepted,
    /// A record with that key already exists; the candidate was discarded
    Conflict,
}

/// Per-batch result returned to the caller of `process_batch`.
///
/// Serializes to the ingest response body:
/// `{status, processed_count, duplicates_skipped, total_received}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub status: String,
    pub processed_count: u64,
    pub duplicates_skipped: u64,
    pub total_received: u64,
    /// Records dropped by validation or record-scoped storage errors
    #[serde(skip)]
    pub rejected_count: u64,
    /// Keys newly stored by this batch, in input order
    #[serde(skip)]
    pub accepted_keys: Vec<EventKey>,
}

impl BatchSummary {
    pub fn empty() -> Self {
        Self {
            status: "ok".to_string(),
            processed_count: 0,
            duplicates_skipped: 0,
            total_received: 0,
            rejected_count: 0,
            accepted_keys: Vec::new(),
        }
    }
}
