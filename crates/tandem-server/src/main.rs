//! Main entry point for the Tandem standalone master.

use tandem_server::{
    metrics,
    model::Configuration,
    startup::{self, ShutdownSignal, StandaloneMaster},
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let configuration = Configuration::new()?;
    let _logging_guard = startup::init_logging(&configuration.logging_config())?;

    if configuration.metrics_enabled() {
        let address = configuration.metrics_address()?;
        metrics::install_exporter(address)?;
        info!(address = %address, "Prometheus exporter listening");
    }
    metrics::init_metrics();

    let settings = configuration.ha_settings();
    info!(
        server_id = settings.server_id,
        lock_read_timeout_ms = settings.lock_read_timeout_ms,
        conversation_timeout = ?settings.conversation_timeout(),
        "Starting Tandem master"
    );

    let standalone = StandaloneMaster::new(settings, configuration.store_id());
    let epoch = standalone.start()?;
    metrics::record_epoch(epoch);

    let shutdown = ShutdownSignal::new();
    startup::wait_for_shutdown_signal(&shutdown).await;

    standalone.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
