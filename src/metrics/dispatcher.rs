//! Dispatcher Metrics

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct DispatcherMetrics;

pub fn attempt() {
    ::metrics::counter!(phase_metric!(counter, "dispatcher", "attempts")).increment(1);
}

pub fn acked(duration_secs: f64) {
    ::metrics::counter!(phase_metric!(counter, "dispatcher", "acks")).increment(1);
    ::metrics::histogram!(phase_metric!(histogram, "dispatcher", "enqueue_duration_seconds"))
        .record(duration_secs);
}

pub fn rejected() {
    ::metrics::counter!(phase_metric!(counter, "dispatcher", "rejects")).increment(1);
}

pub fn transport_failure() {
    ::metrics::counter!(phase_metric!(counter, "dispatcher", "transport_failures")).increment(1);
}

pub fn backoff_delay(seconds: f64) {
    ::metrics::histogram!(phase_metric!(histogram, "dispatcher", "backoff_delay_seconds"))
        .record(seconds);
}

impl PhaseMetrics for DispatcherMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "dispatcher", "attempts"));
        let _ = counter!(phase_metric!(counter, "dispatcher", "acks"));
        let _ = counter!(phase_metric!(counter, "dispatcher", "rejects"));
        let _ = counter!(phase_metric!(counter, "dispatcher", "transport_failures"));
        let _ = histogram!(phase_metric!(histogram, "dispatcher", "enqueue_duration_seconds"));
        let _ = histogram!(phase_metric!(histogram, "dispatcher", "backoff_delay_seconds"));
    }

    fn phase_name() -> &'static str {
        "dispatcher"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "dispatcher", "attempts"),
                metric_type: MetricType::Counter,
                help: "Enqueue attempts against the downstream queue",
            },
            MetricDoc {
                name: phase_metric!(counter, "dispatcher", "acks"),
                metric_type: MetricType::Counter,
                help: "Records acknowledged downstream and marked dispatched",
            },
            MetricDoc {
                name: phase_metric!(counter, "dispatcher", "rejects"),
                metric_type: MetricType::Counter,
                help: "Attempts rejected by the downstream queue",
            },
            MetricDoc {
                name: phase_metric!(counter, "dispatcher", "transport_failures"),
                metric_type: MetricType::Counter,
                help: "Attempts that failed or timed out in transport",
            },
            MetricDoc {
                name: phase_metric!(histogram, "dispatcher", "enqueue_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Latency of successful enqueue calls",
            },
            MetricDoc {
                name: phase_metric!(histogram, "dispatcher", "backoff_delay_seconds"),
                metric_type: MetricType::Histogram,
                help: "Delay scheduled before the next retry of a record",
            },
        ]
    }
}
