//! Gateway Endpoint Metrics
//!
//! Outcomes of `POST /v1/events/ingest`: accepted, duplicate, invalid, and
//! unavailable (overload or storage failure), plus end-to-end latency.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct GatewayMetrics;

pub fn request_accepted() {
    ::metrics::counter!(phase_metric!(counter, "gateway", "requests_accepted")).increment(1);
}

pub fn request_duplicate() {
    ::metrics::counter!(phase_metric!(counter, "gateway", "requests_duplicate")).increment(1);
}

pub fn request_invalid() {
    ::metrics::counter!(phase_metric!(counter, "gateway", "requests_invalid")).increment(1);
}

pub fn request_unavailable() {
    ::metrics::counter!(phase_metric!(counter, "gateway", "requests_unavailable")).increment(1);
}

pub fn request_duration(seconds: f64) {
    ::metrics::histogram!(phase_metric!(histogram, "gateway", "request_duration_seconds"))
        .record(seconds);
}

impl PhaseMetrics for GatewayMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "gateway", "requests_accepted"));
        let _ = counter!(phase_metric!(counter, "gateway", "requests_duplicate"));
        let _ = counter!(phase_metric!(counter, "gateway", "requests_invalid"));
        let _ = counter!(phase_metric!(counter, "gateway", "requests_unavailable"));
        let _ = histogram!(phase_metric!(histogram, "gateway", "request_duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "gateway"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "gateway", "requests_accepted"),
                metric_type: MetricType::Counter,
                help: "Envelopes staged for the first time",
            },
            MetricDoc {
                name: phase_metric!(counter, "gateway", "requests_duplicate"),
                metric_type: MetricType::Counter,
                help: "Envelopes answered from the idempotency index",
            },
            MetricDoc {
                name: phase_metric!(counter, "gateway", "requests_invalid"),
                metric_type: MetricType::Counter,
                help: "Envelopes rejected by validation (400)",
            },
            MetricDoc {
                name: phase_metric!(counter, "gateway", "requests_unavailable"),
                metric_type: MetricType::Counter,
                help: "Envelopes refused because of overload or storage failure (503)",
            },
            MetricDoc {
                name: phase_metric!(histogram, "gateway", "request_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Time from request receipt to response",
            },
        ]
    }
}
