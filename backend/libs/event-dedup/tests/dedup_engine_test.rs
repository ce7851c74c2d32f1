//! Engine tests against the in-memory store
//!
//! These tests verify:
//! 1. Sequential resubmission is counted as duplicate
//! 2. Counter accounting for distinct, repeated and invalid records
//! 3. Concurrent submitters of the same key (exactly one winner)
//! 4. All-or-nothing batches when the commit fails
//! 5. Waiting on a key held by an in-flight batch
//! 6. Listing order, topic filter and distinct topics
//! 7. Batches waiting on each other in a cycle (exactly one is aborted)

use event_dedup::{
    validate_event, BatchProcessor, BatchTx, DedupError, DedupResult, Event, EventStore,
    InsertOutcome, MemoryEventStore,
};
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn event(topic: &str, event_id: &str) -> Value {
    json!({
        "topic": topic,
        "event_id": event_id,
        "timestamp": "2024-01-01T00:00:00Z",
        "source": "s",
        "payload": {}
    })
}

fn event_at(topic: &str, event_id: &str, timestamp: &str) -> Value {
    json!({
        "topic": topic,
        "event_id": event_id,
        "timestamp": timestamp,
        "source": "node-1",
        "payload": {"value": 42}
    })
}

/// Insert `event`, then commit on success or roll back on failure.
async fn insert_then_settle(mut tx: Box<dyn BatchTx>, event: &Event) -> DedupResult<InsertOutcome> {
    let result = tx.try_insert(event).await;
    match result {
        Ok(_) => tx.commit().await?,
        Err(_) => tx.rollback().await?,
    }
    result
}

async fn setup() -> (MemoryEventStore, BatchProcessor) {
    let store = MemoryEventStore::new();
    store.ensure_counters().await.expect("init counters");
    let processor = BatchProcessor::new(Arc::new(store.clone()));
    (store, processor)
}

#[tokio::test]
async fn test_sequential_resubmission_is_duplicate() {
    let (store, processor) = setup().await;
    let e = event("t", "a");

    let first = processor.process_batch(&[e.clone()]).await.unwrap();
    assert_eq!(first.processed_count, 1);
    assert_eq!(first.duplicates_skipped, 0);
    assert_eq!(first.total_received, 1);

    let second = processor.process_batch(&[e]).await.unwrap();
    assert_eq!(second.processed_count, 0);
    assert_eq!(second.duplicates_skipped, 1);

    let counters = store.counters().await.unwrap().unwrap();
    assert_eq!(counters.received, 2);
    assert_eq!(counters.unique_processed, 1);
    assert_eq!(counters.duplicate_dropped, 1);
}

#[tokio::test]
async fn test_distinct_batch_then_resubmission() {
    let (store, processor) = setup().await;
    let batch: Vec<Value> = (0..5).map(|i| event("sensor", &format!("x{i}"))).collect();

    let first = processor.process_batch(&batch).await.unwrap();
    assert_eq!(first.processed_count, 5);
    let after_first = store.counters().await.unwrap().unwrap();
    assert_eq!(after_first.unique_processed, 5);
    assert_eq!(after_first.received, 5);
    assert_eq!(after_first.duplicate_dropped, 0);

    let second = processor.process_batch(&batch).await.unwrap();
    assert_eq!(second.processed_count, 0);
    assert_eq!(second.duplicates_skipped, 5);
    let after_second = store.counters().await.unwrap().unwrap();
    assert_eq!(after_second.unique_processed, 5);
    assert_eq!(after_second.received, 10);
    assert_eq!(after_second.duplicate_dropped, 5);
}

#[tokio::test]
async fn test_invalid_records_are_dropped_but_received() {
    let (store, processor) = setup().await;

    let mut bad_time = event("t", "bad-time");
    bad_time["timestamp"] = json!("not_a_timestamp");

    let batch = vec![
        event("t", "ok-1"),
        json!({"event_id": "no_topic"}),
        json!({"topic": "missing_event_id"}),
        bad_time,
        json!(42),
        event("t", "ok-2"),
    ];

    let summary = processor.process_batch(&batch).await.unwrap();
    assert_eq!(summary.total_received, 6);
    assert_eq!(summary.processed_count, 2);
    assert_eq!(summary.duplicates_skipped, 0);
    assert_eq!(summary.rejected_count, 4);

    let counters = store.counters().await.unwrap().unwrap();
    assert_eq!(counters.received, 6);
    assert_eq!(counters.unique_processed, 2);
    assert_eq!(counters.rejected(), 4);
}

#[tokio::test]
async fn test_all_invalid_batch_still_commits_received() {
    let (store, processor) = setup().await;

    let summary = processor
        .process_batch(&[json!({"event_id": "no_topic"})])
        .await
        .unwrap();
    assert_eq!(summary.processed_count, 0);
    assert_eq!(summary.total_received, 1);

    let counters = store.counters().await.unwrap().unwrap();
    assert_eq!(counters.received, 1);
    assert_eq!(counters.unique_processed, 0);
    assert_eq!(counters.duplicate_dropped, 0);
}

#[tokio::test]
async fn test_duplicate_inside_one_batch() {
    let (store, processor) = setup().await;
    let e = event("t", "twice");

    let summary = processor
        .process_batch(&[e.clone(), event("t", "other"), e])
        .await
        .unwrap();
    assert_eq!(summary.processed_count, 2);
    assert_eq!(summary.duplicates_skipped, 1);
    assert_eq!(summary.accepted_keys.len(), 2);
    assert_eq!(summary.accepted_keys[0].event_id, "twice");

    let rows = store.list_events(Some("t"), 100).await.unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_empty_batch_touches_nothing() {
    let (store, processor) = setup().await;
    let before = store.counters().await.unwrap().unwrap();

    let summary = processor.process_batch(&[]).await.unwrap();
    assert_eq!(summary.processed_count, 0);
    assert_eq!(summary.duplicates_skipped, 0);
    assert_eq!(summary.total_received, 0);

    assert_eq!(store.counters().await.unwrap().unwrap(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_concurrent_submitters_one_winner() {
    let (store, processor) = setup().await;
    let e = event("concurrency-test", "same-event");

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let processor = processor.clone();
            let e = e.clone();
            tokio::spawn(async move { processor.process_batch(&[e]).await })
        })
        .collect();

    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("batch failed"))
        .collect();

    let processed: u64 = results.iter().map(|r| r.processed_count).sum();
    let duplicates: u64 = results.iter().map(|r| r.duplicates_skipped).sum();
    assert_eq!(processed, 1);
    assert_eq!(duplicates, 9);

    let rows = store
        .list_events(Some("concurrency-test"), 100)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    let counters = store.counters().await.unwrap().unwrap();
    assert_eq!(counters.received, 10);
    assert_eq!(counters.unique_processed, 1);
    assert_eq!(counters.duplicate_dropped, 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counters_consistent_under_overlapping_batches() {
    let (store, processor) = setup().await;

    // Keys are inserted in ascending order within every batch so waits on
    // in-flight keys can never form a cycle.
    let handles: Vec<_> = (0..20)
        .map(|task| {
            let processor = processor.clone();
            tokio::spawn(async move {
                let mut ids: Vec<usize> = (0..10).map(|i| (task * 3 + i * 7) % 50).collect();
                ids.sort_unstable();
                let mut batch: Vec<Value> = ids
                    .iter()
                    .map(|id| event("overlap", &format!("k{id:02}")))
                    .collect();
                batch.push(json!({"topic": "overlap"}));
                processor.process_batch(&batch).await
            })
        })
        .collect();

    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("batch failed"))
        .collect();

    let processed: u64 = results.iter().map(|r| r.processed_count).sum();
    let duplicates: u64 = results.iter().map(|r| r.duplicates_skipped).sum();

    let rows = store.list_events(Some("overlap"), 1000).await.unwrap();
    let counters = store.counters().await.unwrap().unwrap();

    assert_eq!(processed as usize, rows.len());
    assert_eq!(counters.unique_processed, processed as i64);
    assert_eq!(counters.duplicate_dropped, duplicates as i64);
    assert_eq!(counters.received, 20 * 11);
    assert_eq!(processed + duplicates, 20 * 10);
    assert_eq!(counters.rejected(), 20);
}

#[tokio::test]
async fn test_commit_failure_rolls_back_whole_batch() {
    let (store, processor) = setup().await;
    let before = store.counters().await.unwrap().unwrap();
    let batch: Vec<Value> = (0..3).map(|i| event("rollback", &format!("r{i}"))).collect();

    store.fail_next_commits(1);
    let err = processor.process_batch(&batch).await.unwrap_err();
    assert!(matches!(err, DedupError::Unavailable(_)));

    // Nothing from the failed batch is visible
    assert!(store.list_events(Some("rollback"), 100).await.unwrap().is_empty());
    assert!(store.distinct_topics().await.unwrap().is_empty());
    assert_eq!(store.counters().await.unwrap().unwrap(), before);

    // Retrying the same batch is safe and now succeeds
    let retry = processor.process_batch(&batch).await.unwrap();
    assert_eq!(retry.processed_count, 3);
    assert_eq!(retry.duplicates_skipped, 0);

    let counters = store.counters().await.unwrap().unwrap();
    assert_eq!(counters.received, 3);
    assert_eq!(counters.unique_processed, 3);
}

#[tokio::test]
async fn test_waits_for_in_flight_key_then_conflicts() {
    let (store, processor) = setup().await;
    let raw = event("t", "held");
    let held = validate_event(&raw).unwrap();

    let mut tx = store.begin_batch().await.unwrap();
    assert_eq!(tx.try_insert(&held).await.unwrap(), InsertOutcome::Accepted);

    let contender = {
        let processor = processor.clone();
        let raw = raw.clone();
        tokio::spawn(async move { processor.process_batch(&[raw]).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!contender.is_finished(), "contender must wait for the owner");

    tx.commit().await.unwrap();

    let summary = contender.await.unwrap().unwrap();
    assert_eq!(summary.processed_count, 0);
    assert_eq!(summary.duplicates_skipped, 1);
}

#[tokio::test]
async fn test_waits_for_in_flight_key_then_accepts_after_rollback() {
    let (store, processor) = setup().await;
    let raw = event("t", "released");
    let held = validate_event(&raw).unwrap();

    let mut tx = store.begin_batch().await.unwrap();
    assert_eq!(tx.try_insert(&held).await.unwrap(), InsertOutcome::Accepted);

    let contender = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.process_batch(&[raw]).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.rollback().await.unwrap();

    let summary = contender.await.unwrap().unwrap();
    assert_eq!(summary.processed_count, 1);
    assert_eq!(summary.duplicates_skipped, 0);
    assert_eq!(store.list_events(Some("t"), 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_dropped_batch_releases_its_keys() {
    let (store, processor) = setup().await;
    let raw = event("t", "dropped");
    let held = validate_event(&raw).unwrap();

    {
        let mut tx = store.begin_batch().await.unwrap();
        tx.try_insert(&held).await.unwrap();
    }

    let summary = processor.process_batch(&[raw]).await.unwrap();
    assert_eq!(summary.processed_count, 1);
}

#[tokio::test]
async fn test_lock_wait_timeout_fails_waiting_batch() {
    let store = MemoryEventStore::with_lock_wait(Duration::from_millis(50));
    store.ensure_counters().await.unwrap();
    let processor = BatchProcessor::new(Arc::new(store.clone()));
    let before = store.counters().await.unwrap().unwrap();

    let raw = event("t", "stuck");
    let held = validate_event(&raw).unwrap();
    let mut tx = store.begin_batch().await.unwrap();
    tx.try_insert(&held).await.unwrap();

    let err = processor
        .process_batch(&[event("t", "free"), raw])
        .await
        .unwrap_err();
    assert!(matches!(err, DedupError::LockTimeout { .. }));
    assert!(err.is_transient());

    // The sibling insert of the failed batch was rolled back too
    tx.commit().await.unwrap();
    let rows = store.list_events(Some("t"), 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_id, "stuck");
    assert_eq!(store.counters().await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn test_listing_newest_first_with_topic_filter() {
    let (store, processor) = setup().await;

    processor
        .process_batch(&[
            event_at("alpha", "a1", "2024-01-01T00:00:00Z"),
            event_at("alpha", "a2", "2024-01-03T00:00:00Z"),
            event_at("beta", "b1", "2024-01-02T00:00:00Z"),
            event_at("alpha", "a3", "2024-01-02T00:00:00Z"),
        ])
        .await
        .unwrap();

    let alpha = store.list_events(Some("alpha"), 100).await.unwrap();
    let ids: Vec<&str> = alpha.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids, vec!["a2", "a3", "a1"]);
    assert_eq!(alpha[0].payload, json!({"value": 42}));

    // b1 and a3 share a timestamp; the later insert comes first
    let limited = store.list_events(None, 3).await.unwrap();
    let ids: Vec<&str> = limited.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids, vec!["a2", "a3", "b1"]);

    assert!(store.list_events(Some("unknown"), 100).await.unwrap().is_empty());
    assert_eq!(
        store.distinct_topics().await.unwrap(),
        vec!["alpha".to_string(), "beta".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ensure_counters_race_creates_once() {
    let store = MemoryEventStore::new();

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.ensure_counters().await })
        })
        .collect();

    let created = join_all(handles)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(true))))
        .count();
    assert_eq!(created, 1);

    let counters = store.counters().await.unwrap().unwrap();
    assert_eq!(counters.received, 0);
}

#[tokio::test]
async fn test_counters_absent_until_initialized() {
    let store = MemoryEventStore::new();
    assert!(store.counters().await.unwrap().is_none());

    // A committed batch creates the row on demand, like the upsert in PostgreSQL
    let processor = BatchProcessor::new(Arc::new(store.clone()));
    processor.process_batch(&[event("t", "a")]).await.unwrap();
    let counters = store.counters().await.unwrap().unwrap();
    assert_eq!(counters.unique_processed, 1);
}

#[tokio::test]
async fn test_crossed_waits_abort_exactly_one() {
    // Default lock wait is 5s; the cycle must resolve long before that
    let (store, _) = setup().await;
    let x = validate_event(&event("t", "x")).unwrap();
    let y = validate_event(&event("t", "y")).unwrap();

    let mut a = store.begin_batch().await.unwrap();
    let mut b = store.begin_batch().await.unwrap();
    assert_eq!(a.try_insert(&x).await.unwrap(), InsertOutcome::Accepted);
    assert_eq!(b.try_insert(&y).await.unwrap(), InsertOutcome::Accepted);

    let (a_result, b_result) = tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(insert_then_settle(a, &y), insert_then_settle(b, &x))
    })
    .await
    .expect("crossed waits should resolve without waiting out the lock timeout");

    let results = [a_result, b_result];
    let deadlocks = results
        .iter()
        .filter(|r| matches!(r, Err(DedupError::Deadlock { .. })))
        .count();
    let accepted = results
        .iter()
        .filter(|r| matches!(r, Ok(InsertOutcome::Accepted)))
        .count();
    assert_eq!(deadlocks, 1, "exactly one batch is aborted: {results:?}");
    assert_eq!(accepted, 1, "the other batch proceeds: {results:?}");
    assert!(results.iter().all(|r| !matches!(r, Err(DedupError::LockTimeout { .. }))));

    // The survivor committed both keys, the victim left nothing behind
    let rows = store.list_events(Some("t"), 10).await.unwrap();
    let mut ids: Vec<&str> = rows.iter().map(|e| e.event_id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["x", "y"]);
}

#[tokio::test]
async fn test_three_way_wait_cycle_aborts_one() {
    let (store, _) = setup().await;
    let keys: Vec<Event> = ["k0", "k1", "k2"]
        .iter()
        .map(|id| validate_event(&event("ring", id)).unwrap())
        .collect();

    let mut txs = Vec::new();
    for key in &keys {
        let mut tx = store.begin_batch().await.unwrap();
        assert_eq!(tx.try_insert(key).await.unwrap(), InsertOutcome::Accepted);
        txs.push(tx);
    }

    // Batch i waits on the key held by batch i + 1
    let mut txs = txs.into_iter();
    let (t0, t1, t2) = (txs.next().unwrap(), txs.next().unwrap(), txs.next().unwrap());
    let results = tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(
            insert_then_settle(t0, &keys[1]),
            insert_then_settle(t1, &keys[2]),
            insert_then_settle(t2, &keys[0]),
        )
    })
    .await
    .expect("wait cycle should resolve without waiting out the lock timeout");

    let results = [results.0, results.1, results.2];
    let deadlocks = results
        .iter()
        .filter(|r| matches!(r, Err(DedupError::Deadlock { .. })))
        .count();
    assert_eq!(deadlocks, 1, "{results:?}");
    assert!(results.iter().filter(|r| r.is_ok()).count() == 2, "{results:?}");

    let rows = store.list_events(Some("ring"), 10).await.unwrap();
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn test_deadlock_victim_batch_can_be_resubmitted() {
    let (store, processor) = setup().await;
    let x = validate_event(&event("t", "x")).unwrap();

    // Holder of x waits on y, which the processor's batch will take first
    let mut holder = store.begin_batch().await.unwrap();
    holder.try_insert(&x).await.unwrap();

    let batch = vec![event("t", "y"), event("t", "x")];
    let submitter = {
        let processor = processor.clone();
        let batch = batch.clone();
        tokio::spawn(async move { processor.process_batch(&batch).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let y = validate_event(&event("t", "y")).unwrap();
    let holder_result = holder.try_insert(&y).await;
    assert!(matches!(holder_result, Err(DedupError::Deadlock { .. })));
    assert!(holder_result.unwrap_err().is_transient());
    holder.rollback().await.unwrap();

    let summary = submitter.await.unwrap().unwrap();
    assert_eq!(summary.processed_count, 2);

    let counters = store.counters().await.unwrap().unwrap();
    assert_eq!(counters.unique_processed, 2);
}
