//! Prometheus metrics for the ingestion engine.
//!
//! All metrics use the default Prometheus registry and follow naming conventions:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)

use lazy_static::lazy_static;
use prometheus::{register_histogram, register_int_counter_vec, Histogram, IntCounterVec};

lazy_static! {
    // ==================== LATENCY METRICS ====================

    pub static ref FLUSH_DURATION: Histogram = register_histogram!(
        "eqlog_flush_duration_seconds",
        "Time spent writing one batch to the store, retries included",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    )
    .unwrap();

    // ==================== THROUGHPUT METRICS ====================
    pub static ref RECORDS_PARSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "eqlog_records_parsed_total",
        "Records recovered by format",
        &["format"]
    )
    .unwrap();
    pub static ref RECORDS_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "eqlog_records_dropped_total",
        "Malformed lines or rows dropped by format",
        &["format"]
    )
    .unwrap();
    pub static ref ROWS_WRITTEN_TOTAL: IntCounterVec = register_int_counter_vec!(
        "eqlog_rows_written_total",
        "Rows affected by committed writes by table",
        &["table"]
    )
    .unwrap();

    // ==================== OUTCOME COUNTERS ====================
    pub static ref TAIL_SKIPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "eqlog_tail_skips_total",
        "Calls that returned without writing, by reason",
        &["reason"]
    )
    .unwrap();
    pub static ref FLUSH_TOTAL: IntCounterVec = register_int_counter_vec!(
        "eqlog_flush_total",
        "Store writes by status",
        &["status"]
    )
    .unwrap();
}
