//! Staging Log Metrics
//!
//! Durable appends, backpressure rejections, the pending backlog and
//! compaction of dispatched records.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct StagingMetrics;

pub fn append_success(envelope_bytes: usize) {
    ::metrics::counter!(phase_metric!(counter, "staging", "appends_success")).increment(1);
    ::metrics::histogram!(phase_metric!(histogram, "staging", "append_bytes"))
        .record(envelope_bytes as f64);
}

pub fn append_error() {
    ::metrics::counter!(phase_metric!(counter, "staging", "appends_error")).increment(1);
}

pub fn overloaded() {
    ::metrics::counter!(phase_metric!(counter, "staging", "overload_rejections")).increment(1);
}

pub fn pending(count: u64) {
    ::metrics::gauge!(phase_metric!(gauge, "staging", "pending_records")).set(count as f64);
}

pub fn compacted(records: usize) {
    ::metrics::counter!(phase_metric!(counter, "staging", "compacted_records"))
        .increment(records as u64);
}

impl PhaseMetrics for StagingMetrics {
    fn register_metrics() {
        use metrics::{counter, gauge, histogram};

        let _ = counter!(phase_metric!(counter, "staging", "appends_success"));
        let _ = counter!(phase_metric!(counter, "staging", "appends_error"));
        let _ = counter!(phase_metric!(counter, "staging", "overload_rejections"));
        let _ = counter!(phase_metric!(counter, "staging", "compacted_records"));
        let _ = histogram!(phase_metric!(histogram, "staging", "append_bytes"));
        let _ = gauge!(phase_metric!(gauge, "staging", "pending_records"));
    }

    fn phase_name() -> &'static str {
        "staging"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "staging", "appends_success"),
                metric_type: MetricType::Counter,
                help: "Records durably appended to the staging log",
            },
            MetricDoc {
                name: phase_metric!(counter, "staging", "appends_error"),
                metric_type: MetricType::Counter,
                help: "Appends that failed in the storage medium",
            },
            MetricDoc {
                name: phase_metric!(counter, "staging", "overload_rejections"),
                metric_type: MetricType::Counter,
                help: "Appends refused because pending records reached the high-water mark",
            },
            MetricDoc {
                name: phase_metric!(counter, "staging", "compacted_records"),
                metric_type: MetricType::Counter,
                help: "Dispatched records removed by compaction",
            },
            MetricDoc {
                name: phase_metric!(histogram, "staging", "append_bytes"),
                metric_type: MetricType::Histogram,
                help: "Serialized envelope size in bytes",
            },
            MetricDoc {
                name: phase_metric!(gauge, "staging", "pending_records"),
                metric_type: MetricType::Gauge,
                help: "Records accepted but not yet dispatched",
            },
        ]
    }
}
