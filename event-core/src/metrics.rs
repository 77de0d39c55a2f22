//! Prometheus metrics for the event log

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_int_counter, CounterVec, IntCounter};

lazy_static! {
    /// Events recorded in the durable log
    pub static ref EVENTS_RECORDED_TOTAL: CounterVec = register_counter_vec!(
        "event_log_recorded_total",
        "Events recorded in the durable log",
        &["event_type", "status"]
    )
    .unwrap();

    /// Log lines skipped as unparsable during reads
    pub static ref CORRUPT_LINES_TOTAL: IntCounter = register_int_counter!(
        "event_log_corrupt_lines_total",
        "Log lines skipped as unparsable during reads"
    )
    .unwrap();

    /// Concurrent-write conflicts detected during reconstruction
    pub static ref CONFLICTS_DETECTED_TOTAL: IntCounter = register_int_counter!(
        "event_log_conflicts_detected_total",
        "Concurrent-write conflicts detected during reconstruction"
    )
    .unwrap();

    /// Query index rebuilds (transparent or operator-requested)
    pub static ref INDEX_REBUILDS_TOTAL: IntCounter = register_int_counter!(
        "event_log_index_rebuilds_total",
        "Query index rebuilds"
    )
    .unwrap();
}
