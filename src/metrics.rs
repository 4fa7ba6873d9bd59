use lazy_static::lazy_static;
use prometheus::{register_int_counter, Encoder, IntCounter, TextEncoder};

lazy_static! {
    // Fetch metrics
    pub static ref PAGES_FETCHED: IntCounter = register_int_counter!(
        "cw2mkr_pages_fetched_total",
        "Total number of GetMetricData pages fetched"
    ).unwrap();

    pub static ref SERIES_DROPPED: IntCounter = register_int_counter!(
        "cw2mkr_series_dropped_total",
        "Total number of series dropped because their label did not decode"
    ).unwrap();

    pub static ref ZERO_POINTS_FILLED: IntCounter = register_int_counter!(
        "cw2mkr_zero_points_filled_total",
        "Total number of zero-valued points synthesized for emit_zero labels"
    ).unwrap();

    // Publish metrics
    pub static ref CHUNKS_POSTED: IntCounter = register_int_counter!(
        "cw2mkr_chunks_posted_total",
        "Total number of chunks accepted by Mackerel"
    ).unwrap();

    pub static ref CHUNKS_FAILED: IntCounter = register_int_counter!(
        "cw2mkr_chunks_failed_total",
        "Total number of chunks Mackerel rejected or that failed to send"
    ).unwrap();
}

pub fn record_page() {
    PAGES_FETCHED.inc();
}

pub fn record_dropped_series() {
    SERIES_DROPPED.inc();
}

pub fn record_zero_filled(count: usize) {
    ZERO_POINTS_FILLED.inc_by(count as u64);
}

pub fn record_chunk_posted() {
    CHUNKS_POSTED.inc();
}

pub fn record_chunk_failed() {
    CHUNKS_FAILED.inc();
}

/// Text exposition of every counter in the default registry.
pub fn render() -> String {
    let mut buf = Vec::new();
    if TextEncoder::new()
        .encode(&prometheus::gather(), &mut buf)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
