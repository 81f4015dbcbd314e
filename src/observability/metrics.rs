use metrics::{counter, describe_counter, describe_gauge, gauge};

// ---------------------------------------------------------------------------
// Metrics catalog
// ---------------------------------------------------------------------------

/// Register all metric descriptors at startup.
///
/// This must be called once before any metrics are recorded.
/// Descriptors provide human-readable descriptions for Prometheus.
pub fn describe_all_metrics() {
    describe_counter!(
        "mediarelay_rtmp_conns_total",
        "Total accepted RTMP connections"
    );
    describe_gauge!("mediarelay_rtmp_conns_open", "Currently open RTMP connections");
    describe_gauge!("mediarelay_rtmp_readers", "RTMP connections in read state");
    describe_gauge!(
        "mediarelay_rtmp_publishers",
        "RTMP connections in publish state"
    );
    describe_counter!(
        "mediarelay_auth_failures_total",
        "Authentication failures by action"
    );
    describe_counter!(
        "mediarelay_stream_items_total",
        "Items fanned out on the internal stream bus"
    );
}

// ---------------------------------------------------------------------------
// Recording helpers
// ---------------------------------------------------------------------------

pub fn inc_conns_opened() {
    counter!("mediarelay_rtmp_conns_total").increment(1);
    gauge!("mediarelay_rtmp_conns_open").increment(1.0);
}

pub fn dec_conns_open() {
    gauge!("mediarelay_rtmp_conns_open").decrement(1.0);
}

pub fn inc_readers() {
    gauge!("mediarelay_rtmp_readers").increment(1.0);
}

pub fn dec_readers() {
    gauge!("mediarelay_rtmp_readers").decrement(1.0);
}

pub fn inc_publishers() {
    gauge!("mediarelay_rtmp_publishers").increment(1.0);
}

pub fn dec_publishers() {
    gauge!("mediarelay_rtmp_publishers").decrement(1.0);
}

pub fn inc_auth_failures(action: &'static str) {
    counter!("mediarelay_auth_failures_total", "action" => action).increment(1);
}

pub fn add_stream_items(n: u64) {
    counter!("mediarelay_stream_items_total").increment(n);
}
