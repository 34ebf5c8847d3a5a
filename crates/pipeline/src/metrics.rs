use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounter,
    IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref DETECTIONS_INGESTED_TOTAL: IntCounter = register_int_counter!(
        "vigil_detections_ingested_total",
        "Total number of detection events accepted by the aggregator."
    )
    .unwrap();
    pub static ref FAST_PATH_TOTAL: IntCounter = register_int_counter!(
        "vigil_fast_path_total",
        "Total number of detections that bypassed batching."
    )
    .unwrap();
    pub static ref BATCHES_CLOSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "vigil_batches_closed_total",
        "Total number of batches closed, by close reason.",
        &["reason"]
    )
    .unwrap();
    pub static ref ANALYSIS_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "vigil_analysis_failures_total",
        "Total number of analysis requests that failed after retries."
    )
    .unwrap();
    pub static ref ANALYSIS_FALLBACKS_TOTAL: IntCounter = register_int_counter!(
        "vigil_analysis_fallbacks_total",
        "Total number of events processed with the fallback risk assessment."
    )
    .unwrap();
    pub static ref ALERTS_CREATED_TOTAL: IntCounter = register_int_counter!(
        "vigil_alerts_created_total",
        "Total number of alerts created."
    )
    .unwrap();
    pub static ref ALERTS_SUPPRESSED_TOTAL: IntCounter = register_int_counter!(
        "vigil_alerts_suppressed_total",
        "Total number of alerts suppressed by deduplication."
    )
    .unwrap();
    pub static ref DEAD_LETTERS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "vigil_dead_letters_total",
        "Total number of jobs pushed to a dead letter queue.",
        &["queue"]
    )
    .unwrap();
    pub static ref CIRCUIT_STATE: IntGaugeVec = register_int_gauge_vec!(
        "vigil_circuit_state",
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open).",
        &["breaker"]
    )
    .unwrap();
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(DETECTIONS_INGESTED_TOTAL.clone()))
        .expect("Failed to register DETECTIONS_INGESTED_TOTAL");
    REGISTRY
        .register(Box::new(FAST_PATH_TOTAL.clone()))
        .expect("Failed to register FAST_PATH_TOTAL");
    REGISTRY
        .register(Box::new(BATCHES_CLOSED_TOTAL.clone()))
        .expect("Failed to register BATCHES_CLOSED_TOTAL");
    REGISTRY
        .register(Box::new(ANALYSIS_FAILURES_TOTAL.clone()))
        .expect("Failed to register ANALYSIS_FAILURES_TOTAL");
    REGISTRY
        .register(Box::new(ANALYSIS_FALLBACKS_TOTAL.clone()))
        .expect("Failed to register ANALYSIS_FALLBACKS_TOTAL");
    REGISTRY
        .register(Box::new(ALERTS_CREATED_TOTAL.clone()))
        .expect("Failed to register ALERTS_CREATED_TOTAL");
    REGISTRY
        .register(Box::new(ALERTS_SUPPRESSED_TOTAL.clone()))
        .expect("Failed to register ALERTS_SUPPRESSED_TOTAL");
    REGISTRY
        .register(Box::new(DEAD_LETTERS_TOTAL.clone()))
        .expect("Failed to register DEAD_LETTERS_TOTAL");
    REGISTRY
        .register(Box::new(CIRCUIT_STATE.clone()))
        .expect("Failed to register CIRCUIT_STATE");
}

// Gather metrics for exposition
pub fn gather_metrics() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}
