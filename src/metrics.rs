//! Prometheus metrics for the tailing and storage pipeline.
//!
//! All metrics use the default Prometheus registry and follow naming conventions:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    // ==================== LATENCY METRICS ====================
    pub static ref TAIL_PASS_DURATION: Histogram = register_histogram!(
        "logtail_tail_pass_duration_seconds",
        "Time spent in one tail pass over a file",
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .unwrap();

    // ==================== THROUGHPUT METRICS ====================
    pub static ref LINES_READ_TOTAL: IntCounter = register_int_counter!(
        "logtail_lines_read_total",
        "Complete lines consumed from tailed files"
    )
    .unwrap();
    pub static ref LINES_UNMATCHED_TOTAL: IntCounter = register_int_counter!(
        "logtail_lines_unmatched_total",
        "Lines the parser did not match"
    )
    .unwrap();
    pub static ref RECORDS_ENQUEUED_TOTAL: IntCounter = register_int_counter!(
        "logtail_records_enqueued_total",
        "Rows queued for the storage writer"
    )
    .unwrap();
    pub static ref RECORDS_STORED_TOTAL: IntCounter = register_int_counter!(
        "logtail_records_stored_total",
        "Rows inserted by the storage writer"
    )
    .unwrap();

    // ==================== ERROR / EVENT COUNTERS ====================
    pub static ref INSERT_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "logtail_insert_errors_total",
        "Rows dropped because the insert failed"
    )
    .unwrap();
    pub static ref TRUNCATIONS_TOTAL: IntCounter = register_int_counter!(
        "logtail_truncations_total",
        "Tail passes that found a file shorter than its stored offset"
    )
    .unwrap();
    pub static ref ROTATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "logtail_rotations_total",
        "Rotation attempts by outcome",
        &["status"]
    )
    .unwrap();

    // ==================== GAUGE METRICS ====================
    pub static ref ACTIVE_WORKERS: IntGauge = register_int_gauge!(
        "logtail_active_workers",
        "Files currently being tailed"
    )
    .unwrap();
}
