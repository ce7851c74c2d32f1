//! Prometheus metrics for the deduplication engine

use prometheus::{
    register_histogram, register_int_counter_vec, Histogram, IntCounterVec,
};

lazy_static::lazy_static! {
    /// Per-record outcomes (accepted / duplicate / invalid / skipped)
    static ref DEDUP_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dedup_events_total",
        "Ingested records by outcome",
        &["outcome"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Batches by final result (committed / failed)
    static ref DEDUP_BATCHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dedup_batches_total",
        "Processed batches by result",
        &["result"]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref DEDUP_BATCH_DURATION: Histogram = register_histogram!(
        "dedup_batch_duration_seconds",
        "Time to process and commit one batch",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).expect("Prometheus metrics registration should succeed at startup");
}

pub(crate) fn record_outcomes(accepted: u64, duplicates: u64, invalid: u64, skipped: u64) {
    for (outcome, count) in [
        ("accepted", accepted),
        ("duplicate", duplicates),
        ("invalid", invalid),
        ("skipped", skipped),
    ] {
        if count > 0 {
            DEDUP_EVENTS_TOTAL.with_label_values(&[outcome]).inc_by(count);
        }
    }
}

pub(crate) fn record_batch(committed: bool, elapsed_secs: f64) {
    let result = if committed { "committed" } else { "failed" };
    DEDUP_BATCHES_TOTAL.with_label_values(&[result]).inc();
    DEDUP_BATCH_DURATION.observe(elapsed_secs);
}
