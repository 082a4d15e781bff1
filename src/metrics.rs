//! Metrics Bootstrap
//!
//! Installs the Prometheus recorder once per process and hands the render
//! handle to the /metrics endpoint. Individual counters and histograms are
//! registered at their call sites with the `metrics` macros.

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global recorder. Safe to call more than once; only the first
/// call wins (tests and embedded uses may race here).
pub fn install() {
    if HANDLE.get().is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = HANDLE.set(handle);
        }
        Err(e) => {
            // Another recorder is already installed; metrics still flow there
            tracing::debug!("prometheus recorder not installed: {}", e);
        }
    }
}

/// Render handle for the /metrics endpoint
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    HANDLE.get().cloned()
}
