// Metrics module for observability
// Installs the Prometheus exporter and registers metric descriptions

use std::net::SocketAddr;

use anyhow::Context;
use metrics::{describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tandem_common::Epoch;

pub const SERVER_ID: &str = "server_id";
pub const SERVER_EPOCH_START_SECONDS: &str = "server_epoch_start_seconds";

/// Serve `/metrics` on `address` and make it the global recorder
pub fn install_exporter(address: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .with_context(|| format!("Failed to install Prometheus exporter on {}", address))
}

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    tandem_master::metrics::init_metrics();

    describe_gauge!(SERVER_ID, "Cluster member id of this master");
    describe_gauge!(
        SERVER_EPOCH_START_SECONDS,
        "Start time of the current master epoch in seconds since the UNIX epoch"
    );
}

/// Publish the identity of a freshly started epoch
pub fn record_epoch(epoch: Epoch) {
    gauge!(SERVER_ID).set(epoch.server_id() as f64);
    gauge!(SERVER_EPOCH_START_SECONDS).set(epoch.start_millis() as f64 / 1000.0);
}
