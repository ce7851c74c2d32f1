//! Error types for the deduplication engine

use thiserror::Error;

/// `serialization_failure`, `deadlock_detected`
const TRANSIENT_SQLSTATES: [&str; 2] = ["40001", "40P01"];

/// Result type for store and batch operations
pub type DedupResult<T> = Result<T, DedupError>;

/// Errors that can fail a batch.
///
/// Validation failures and key conflicts are NOT represented here: the
/// former are [`crate::ValidationError`] values that never leave the
/// coordinator, the latter is [`crate::InsertOutcome::Conflict`].
#[derive(Error, Debug)]
pub enum DedupError {
    /// Database operation failed (connection, query execution, commit, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Waited too long for another batch holding the same key to finish
    #[error("Timed out waiting for in-flight insert of ({topic}, {event_id})")]
    LockTimeout { topic: String, event_id: String },

    /// Waiting on the key would close a cycle of batches waiting on each
    /// other; this batch is the one aborted
    #[error("Deadlock detected inserting ({topic}, {event_id})")]
    Deadlock { topic: String, event_id: String },

    /// Storage backend refused the operation
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DedupError {
    /// Check if error is a duplicate key violation on the uniqueness constraint
    ///
    /// Inserts use `ON CONFLICT DO NOTHING`, so this only shows up when the
    /// arbiter index is bypassed; callers treat it as a conflict, not a failure.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DedupError::Database(sqlx_err) => sqlx_err
                .as_database_error()
                .map(|db_err| db_err.is_unique_violation())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Check if error only concerns the record being written.
    ///
    /// PostgreSQL SQLSTATE class 22 (data exception) covers values the
    /// database cannot store, e.g. `\u0000` inside text or jsonb. The record
    /// is skipped and the rest of the batch carries on.
    pub fn is_record_scoped(&self) -> bool {
        match self {
            DedupError::Database(sqlx_err) => sqlx_err
                .as_database_error()
                .and_then(|db_err| db_err.code())
                .map(|code| code.starts_with("22"))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Check if error is transient (the whole batch may be retried)
    ///
    /// Besides pool and I/O failures this covers the concurrency aborts
    /// PostgreSQL reports as `40P01` (deadlock) and `40001` (serialization).
    pub fn is_transient(&self) -> bool {
        match self {
            DedupError::Database(sqlx_err) => match sqlx_err {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
                sqlx::Error::Database(db_err) => db_err
                    .code()
                    .is_some_and(|code| TRANSIENT_SQLSTATES.iter().any(|s| *s == code)),
                _ => false,
            },
            DedupError::LockTimeout { .. }
            | DedupError::Deadlock { .. }
            | DedupError::Unavailable(_) => true,
            DedupError::Other(_) => false,
        }
    }
}
