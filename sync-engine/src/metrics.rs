//! Prometheus metrics for the sync engine

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_int_counter, CounterVec, Histogram,
    IntCounter,
};

lazy_static! {
    /// Batch drain passes by outcome
    pub static ref SYNC_BATCHES_TOTAL: CounterVec = register_counter_vec!(
        "sync_engine_batches_total",
        "Batch drain passes by outcome",
        &["status"]
    )
    .unwrap();

    /// Batch call duration
    pub static ref SYNC_BATCH_DURATION: Histogram = register_histogram!(
        "sync_engine_batch_duration_seconds",
        "Batch transport call duration in seconds"
    )
    .unwrap();

    /// Per-event delivery results
    pub static ref EVENTS_SYNCED_TOTAL: CounterVec = register_counter_vec!(
        "sync_engine_events_synced_total",
        "Per-event delivery results",
        &["result"]
    )
    .unwrap();

    /// Enqueue rejections at capacity
    pub static ref QUEUE_REJECTED_TOTAL: IntCounter = register_int_counter!(
        "sync_engine_queue_rejected_total",
        "Enqueue attempts rejected because the queue was at capacity"
    )
    .unwrap();

    /// Entries moved to the dead-letter table
    pub static ref DEAD_LETTERS_TOTAL: IntCounter = register_int_counter!(
        "sync_engine_dead_letters_total",
        "Queue entries moved to the dead-letter table after exhausting retries"
    )
    .unwrap();
}
