//! Metrics registry for coordinating phase-specific metrics
//!
//! Registers every phase's metrics at startup and detects name conflicts early.

use crate::metrics::{MetricDoc, PhaseMetrics};
use std::collections::HashMap;
use tracing::{info, warn};

pub fn register_all_metrics() {
    let mut all_metrics = HashMap::new();

    register_phase_metrics::<super::gateway::GatewayMetrics>(&mut all_metrics);
    register_phase_metrics::<super::staging::StagingMetrics>(&mut all_metrics);
    register_phase_metrics::<super::dispatcher::DispatcherMetrics>(&mut all_metrics);

    info!(
        "Registered {} total metrics across all phases",
        all_metrics.len()
    );
}

fn register_phase_metrics<T: PhaseMetrics>(all_metrics: &mut HashMap<String, MetricDoc>) {
    T::register_metrics();
    let phase_docs = T::metrics_documentation();
    let phase_name = T::phase_name();

    info!(
        "Registering {} metrics for phase '{}'",
        phase_docs.len(),
        phase_name
    );

    for doc in phase_docs {
        if let Some(existing) = all_metrics.get(doc.name) {
            warn!(
                "Metric name conflict detected: '{}' ({}) redefined by phase '{}'",
                doc.name, existing.help, phase_name
            );
        } else {
            all_metrics.insert(doc.name.to_string(), doc);
        }
    }
}

/// Extract phase name from metric name (e.g., "ingest_gw_staging_appends_success_total" -> "staging")
pub fn extract_phase_from_metric_name(metric_name: &str) -> &str {
    if let Some(stripped) = metric_name.strip_prefix("ingest_gw_") {
        if let Some(next_underscore) = stripped.find('_') {
            return &stripped[..next_underscore];
        }
    }
    "unknown"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{DispatcherMetrics, GatewayMetrics, StagingMetrics};

    #[test]
    fn test_extract_phase_from_metric_name() {
        assert_eq!(
            extract_phase_from_metric_name("ingest_gw_gateway_requests_accepted_total"),
            "gateway"
        );
        assert_eq!(
            extract_phase_from_metric_name("ingest_gw_dispatcher_attempts_total"),
            "dispatcher"
        );
        assert_eq!(
            extract_phase_from_metric_name("invalid_metric_name"),
            "unknown"
        );
    }

    #[test]
    fn phase_names_match_metric_prefixes() {
        fn check<T: PhaseMetrics>() {
            for doc in T::metrics_documentation() {
                assert_eq!(extract_phase_from_metric_name(doc.name), T::phase_name());
            }
        }
        check::<GatewayMetrics>();
        check::<StagingMetrics>();
        check::<DispatcherMetrics>();
    }

    #[test]
    fn no_conflicts_across_phases() {
        let mut all = HashMap::new();
        register_phase_metrics::<GatewayMetrics>(&mut all);
        register_phase_metrics::<StagingMetrics>(&mut all);
        register_phase_metrics::<DispatcherMetrics>(&mut all);
        assert_eq!(all.len(), 17);
    }
}
