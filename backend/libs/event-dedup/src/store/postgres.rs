use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Acquire, PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::debug;

use super::{BatchTx, EventStore};
use crate::counters::{CounterDelta, Counters, COUNTERS_ROW_ID};
use crate::error::{DedupError, DedupResult};
use crate::model::{Event, InsertOutcome, StoredEvent};

/// PostgreSQL-backed store.
///
/// Uniqueness is enforced by `uq_dedup_events_topic_event_id`; inserts go
/// through `ON CONFLICT DO NOTHING` on that constraint, so a concurrent
/// insert of the same key waits for the other transaction and then reports
/// a conflict instead of failing.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

/// SQLSTATE `lock_not_available`
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// SQLSTATE `deadlock_detected`
const DEADLOCK_DETECTED: &str = "40P01";

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: None,
        }
    }

    /// Bound how long an insert may wait on a key held by another in-flight
    /// batch. Applied per batch with `SET LOCAL lock_timeout`.
    pub fn with_lock_timeout(pool: PgPool, lock_timeout: Duration) -> Self {
        Self {
            pool,
            lock_timeout: Some(lock_timeout),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

struct PgBatchTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn begin_batch(&self) -> DedupResult<Box<dyn BatchTx>> {
        let mut tx = self.pool.begin().await?;

        if let Some(timeout) = self.lock_timeout {
            sqlx::query("SELECT set_config('lock_timeout', $1, true)")
                .bind(format!("{}ms", timeout.as_millis()))
                .execute(&mut *tx)
                .await?;
        }

        Ok(Box::new(PgBatchTx { tx }))
    }

    async fn ensure_counters(&self) -> DedupResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO dedup_stats (id, received, unique_processed, duplicate_dropped, last_updated)
            VALUES ($1, 0, 0, 0, NOW())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(COUNTERS_ROW_ID)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn counters(&self) -> DedupResult<Option<Counters>> {
        let row = sqlx::query(
            r#"
            SELECT received, unique_processed, duplicate_dropped, last_updated
            FROM dedup_stats
            WHERE id = $1
            "#,
        )
        .bind(COUNTERS_ROW_ID)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(counters_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_events(
        &self,
        topic: Option<&str>,
        limit: i64,
    ) -> DedupResult<Vec<StoredEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, event_id, source, event_timestamp, payload, received_at
            FROM dedup_events
            WHERE ($1::TEXT IS NULL OR topic = $1)
            ORDER BY event_timestamp DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(topic)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| stored_event_from_row(row).map_err(DedupError::from))
            .collect()
    }

    async fn distinct_topics(&self) -> DedupResult<Vec<String>> {
        let topics: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT topic FROM dedup_events ORDER BY topic")
                .fetch_all(&self.pool)
                .await?;

        Ok(topics)
    }
}

#[async_trait]
impl BatchTx for PgBatchTx {
    async fn try_insert(&mut self, event: &Event) -> DedupResult<InsertOutcome> {
        // Per-record savepoint: a failure here rolls back this record only
        let mut savepoint = self.tx.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO dedup_events (topic, event_id, source, event_timestamp, payload)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (topic, event_id) DO NOTHING
            "#,
        )
        .bind(&event.topic)
        .bind(&event.event_id)
        .bind(&event.source)
        .bind(event.timestamp)
        .bind(Json(&event.payload))
        .execute(&mut *savepoint)
        .await;

        match result {
            Ok(done) => {
                savepoint.commit().await?;
                if done.rows_affected() == 1 {
                    Ok(InsertOutcome::Accepted)
                } else {
                    debug!(
                        topic = %event.topic,
                        event_id = %event.event_id,
                        "Duplicate event (key already stored)"
                    );
                    Ok(InsertOutcome::Conflict)
                }
            }
            Err(e) => {
                savepoint.rollback().await?;
                let code = e
                    .as_database_error()
                    .and_then(|db_err| db_err.code())
                    .map(|code| code.into_owned());
                match code.as_deref() {
                    Some(LOCK_NOT_AVAILABLE) => {
                        return Err(DedupError::LockTimeout {
                            topic: event.topic.clone(),
                            event_id: event.event_id.clone(),
                        })
                    }
                    Some(DEADLOCK_DETECTED) => {
                        return Err(DedupError::Deadlock {
                            topic: event.topic.clone(),
                            event_id: event.event_id.clone(),
                        })
                    }
                    _ => {}
                }

                let err = DedupError::from(e);
                if err.is_unique_violation() {
                    Ok(InsertOutcome::Conflict)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn apply_delta(&mut self, delta: CounterDelta) -> DedupResult<()> {
        // Relative addition evaluated by the database; also recreates a
        // missing row instead of silently updating nothing.
        sqlx::query(
            r#"
            INSERT INTO dedup_stats (id, received, unique_processed, duplicate_dropped, last_updated)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (id) DO UPDATE SET
                received = dedup_stats.received + EXCLUDED.received,
                unique_processed = dedup_stats.unique_processed + EXCLUDED.unique_processed,
                duplicate_dropped = dedup_stats.duplicate_dropped + EXCLUDED.duplicate_dropped,
                last_updated = NOW()
            "#,
        )
        .bind(COUNTERS_ROW_ID)
        .bind(delta.received)
        .bind(delta.unique_processed)
        .bind(delta.duplicate_dropped)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> DedupResult<()> {
        let PgBatchTx { tx } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DedupResult<()> {
        let PgBatchTx { tx } = *self;
        tx.rollback().await?;
        Ok(())
    }
}

fn counters_from_row(row: &PgRow) -> Result<Counters, sqlx::Error> {
    Ok(Counters {
        received: row.try_get("received")?,
        unique_processed: row.try_get("unique_processed")?,
        duplicate_dropped: row.try_get("duplicate_dropped")?,
        last_updated: row.try_get::<DateTime<Utc>, _>("last_updated")?,
    })
}

fn stored_event_from_row(row: &PgRow) -> Result<StoredEvent, sqlx::Error> {
    let payload: Json<serde_json::Value> = row.try_get("payload")?;

    Ok(StoredEvent {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        event_id: row.try_get("event_id")?,
        source: row.try_get("source")?,
        timestamp: row.try_get("event_timestamp")?,
        payload: payload.0,
        received_at: row.try_get("received_at")?,
    })
}
