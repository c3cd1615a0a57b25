use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder};

lazy_static! {
    pub static ref WORKER_LOAD: GaugeVec = register_gauge_vec!(
        "archivelive_worker_load",
        "Current work_loads[i] value per upstream worker",
        &["worker_id"]
    )
    .unwrap();
    pub static ref STREAM_RESTARTS_TOTAL: CounterVec = register_counter_vec!(
        "archivelive_stream_restarts_total",
        "Number of supervisor restarts per stream",
        &["stream_name"]
    )
    .unwrap();
    pub static ref STREAM_LAST_ACTIVITY_SECONDS: GaugeVec = register_gauge_vec!(
        "archivelive_stream_last_activity_seconds",
        "Seconds since the segmenter's stdin last accepted a write",
        &["stream_name"]
    )
    .unwrap();
    pub static ref HLS_SEGMENT_COUNT: GaugeVec = register_gauge_vec!(
        "archivelive_hls_segment_count",
        "Current number of .ts segments on disk for a stream",
        &["stream_name"]
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
