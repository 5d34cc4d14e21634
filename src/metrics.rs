// Prometheus metrics for the admission gate
//
// Exposed on the /metrics endpoint:
// - Admission decisions by plan and outcome (counter)
// - Denials by reason (counter)
// - Break-glass activations and rejections (counter)
// - Housekeeping evictions and tracked identities (counter, gauge)

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use crate::quota::{AdmissionInfo, Denial};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Admission metrics
    pub static ref ADMISSIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("admissions_total", "Admission decisions by plan and outcome"),
        &["plan", "outcome"]
    ).expect("Failed to create admissions metric");

    pub static ref ADMISSION_DENIALS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("admission_denials_total", "Admission denials by reason"),
        &["reason"]
    ).expect("Failed to create admission denials metric");

    // Break-glass metrics
    pub static ref BREAK_GLASS_ACTIVATIONS_TOTAL: IntCounter = IntCounter::new(
        "break_glass_activations_total",
        "Total number of break-glass overrides granted"
    ).expect("Failed to create break-glass activations metric");

    pub static ref BREAK_GLASS_REJECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("break_glass_rejections_total", "Break-glass requests refused by reason"),
        &["reason"]
    ).expect("Failed to create break-glass rejections metric");

    // Housekeeping metrics
    pub static ref HOUSEKEEPING_EVICTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("housekeeping_evictions_total", "Idle identities evicted by tracker"),
        &["tracker"]
    ).expect("Failed to create housekeeping evictions metric");

    pub static ref TRACKED_IDENTITIES: IntGauge = IntGauge::new(
        "quota_tracked_identities",
        "Identities with live quota counters"
    ).expect("Failed to create tracked identities metric");
}

/// Register all collectors; repeated calls are no-ops
pub fn init() -> prometheus::Result<()> {
    register(Box::new(ADMISSIONS_TOTAL.clone()))?;
    register(Box::new(ADMISSION_DENIALS_TOTAL.clone()))?;
    register(Box::new(BREAK_GLASS_ACTIVATIONS_TOTAL.clone()))?;
    register(Box::new(BREAK_GLASS_REJECTIONS_TOTAL.clone()))?;
    register(Box::new(HOUSEKEEPING_EVICTIONS_TOTAL.clone()))?;
    register(Box::new(TRACKED_IDENTITIES.clone()))?;
    Ok(())
}

fn register(collector: Box<dyn prometheus::core::Collector>) -> prometheus::Result<()> {
    match REGISTRY.register(collector) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn record_admission(info: &AdmissionInfo) {
    let outcome = if info.allowed { "allowed" } else { "denied" };
    ADMISSIONS_TOTAL
        .with_label_values(&[info.plan.as_str(), outcome])
        .inc();

    if let Some(denial) = info.denial {
        let reason = match denial {
            Denial::Concurrency => "concurrency".to_string(),
            Denial::Window(window) => window.to_string(),
        };
        ADMISSION_DENIALS_TOTAL
            .with_label_values(&[reason.as_str()])
            .inc();
    }
}

pub fn record_break_glass_activated() {
    BREAK_GLASS_ACTIVATIONS_TOTAL.inc();
}

pub fn record_break_glass_rejected(reason: &str) {
    BREAK_GLASS_REJECTIONS_TOTAL
        .with_label_values(&[reason])
        .inc();
}

pub fn record_sweep(tracker: &str, evicted: usize) {
    HOUSEKEEPING_EVICTIONS_TOTAL
        .with_label_values(&[tracker])
        .inc_by(evicted as u64);
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
