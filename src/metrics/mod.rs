//! Centralized metrics infrastructure for the ingestion gateway
//!
//! Each component (gateway endpoint, staging log, dispatcher) defines its own
//! metrics in a dedicated submodule, so names stay unique and ownership is
//! obvious. Recording goes through the `metrics` facade; when no recorder is
//! installed the calls are no-ops, which keeps tests free of exporter setup.

pub mod dispatcher;
pub mod gateway;
pub mod registry;
pub mod staging;

pub use dispatcher::DispatcherMetrics;
pub use gateway::GatewayMetrics;
pub use staging::StagingMetrics;

use std::net::SocketAddr;
use std::sync::Once;
use tracing::{info, warn};

static INIT: Once = Once::new();

/// Install the Prometheus recorder and register every phase's metrics.
///
/// Idempotent. With `listen_addr` set, an HTTP exporter serves `/metrics` on
/// that address; without it the recorder is not installed at all.
pub fn init_metrics(listen_addr: Option<&str>) {
    let Some(addr_str) = listen_addr else {
        info!("metrics exporter disabled (no listen address configured)");
        return;
    };
    let addr: SocketAddr = match addr_str.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("Invalid metrics addr '{}': {}; exporter disabled", addr_str, e);
            return;
        }
    };
    INIT.call_once(|| {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
        match builder.install() {
            Ok(()) => {
                info!("Prometheus exporter listening on http://{}/metrics", addr);
                registry::register_all_metrics();
            }
            Err(e) => {
                warn!("Failed to install Prometheus exporter: {}", e);
            }
        }
    });
}

/// Trait for phase-specific metrics collections
///
/// Each phase implements this trait to provide:
/// - Metric registration at startup
/// - Consistent naming conventions
/// - Documentation of what each metric measures
pub trait PhaseMetrics {
    /// Register all metrics for this phase
    fn register_metrics();

    /// Get the phase name for prefixing metrics
    fn phase_name() -> &'static str;

    /// Get documentation for all metrics in this phase
    fn metrics_documentation() -> Vec<MetricDoc>;
}

/// Documentation for a single metric
#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
    Gauge,
}

/// Macro to create phase-specific metric names with consistent naming
///
/// This ensures all metrics follow the naming convention:
/// ingest_gw_{phase}_{metric_name}[_total]
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("ingest_gw_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("ingest_gw_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("ingest_gw_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;
