//! Prometheus metrics exposition
//!
//! - `hydrator_entities_total` (counter): label `status` (success, failure, interrupted)
//! - `hydrator_remote_errors_total` (counter): label `classification`
//! - `hydrator_malformed_input_total` (counter)
//! - `pool_clients_leased` (gauge) and `pool_quota_waits_total` (counter):
//!   emitted by the pool crate

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use remote::ErrorClassification;

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
///
/// Must be called from within the tokio runtime; the listener runs as a
/// background task for the life of the process.
pub fn install_recorder(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
}

/// Record one processed entity by final status label.
pub fn record_entity(status: &'static str) {
    metrics::counter!("hydrator_entities_total", "status" => status).increment(1);
}

/// Record one classified remote error.
pub fn record_remote_error(classification: ErrorClassification) {
    metrics::counter!("hydrator_remote_errors_total", "classification" => classification.label())
        .increment(1);
}

/// Record one skipped input line.
pub fn record_malformed_input() {
    metrics::counter!("hydrator_malformed_input_total").increment(1);
}
