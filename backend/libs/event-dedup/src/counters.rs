//! Aggregate counters: the singleton cumulative tally.
//!
//! The record is only ever changed by adding a [`CounterDelta`] inside a
//! batch transaction. Backends express the addition relative to the stored
//! value (`received = received + $1`), never as a value computed by the
//! caller, so concurrent batches cannot lose each other's updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Primary key of the singleton counters row
pub const COUNTERS_ROW_ID: i32 = 1;

/// Cumulative totals across every committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Raw records attempted, including invalid and duplicate ones
    pub received: i64,
    /// Records newly inserted
    pub unique_processed: i64,
    /// Validated records that collided with an existing key
    pub duplicate_dropped: i64,
    pub last_updated: DateTime<Utc>,
}

impl Counters {
    pub fn zero(now: DateTime<Utc>) -> Self {
        Self {
            received: 0,
            unique_processed: 0,
            duplicate_dropped: 0,
            last_updated: now,
        }
    }

    /// Add a delta in place.
    pub fn apply(&mut self, delta: &CounterDelta, now: DateTime<Utc>) {
        self.received += delta.received;
        self.unique_processed += delta.unique_processed;
        self.duplicate_dropped += delta.duplicate_dropped;
        self.last_updated = now;
    }

    /// Records counted as received but neither stored nor duplicate
    pub fn rejected(&self) -> i64 {
        self.received - self.unique_processed - self.duplicate_dropped
    }
}

/// Non-negative per-batch increment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub received: i64,
    pub unique_processed: i64,
    pub duplicate_dropped: i64,
}

impl CounterDelta {
    pub fn for_batch(total_received: u64, unique: u64, duplicates: u64) -> Self {
        Self {
            received: total_received as i64,
            unique_processed: unique as i64,
            duplicate_dropped: duplicates as i64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.received == 0 && self.unique_processed == 0 && self.duplicate_dropped == 0
    }

    /// Sum two deltas (used when several deltas are staged on one transaction)
    pub fn merge(self, other: CounterDelta) -> CounterDelta {
        CounterDelta {
            received: self.received + other.received,
            unique_processed: self.unique_processed + other.unique_processed,
            duplicate_dropped: self.duplicate_dropped + other.duplicate_dropped,
        }
    }
}
