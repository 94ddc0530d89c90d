//! Main entry point for the Latchkey lock server.

use latchkey_server::{Configuration, LockServer, startup};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let configuration = Configuration::new()?;
    let _logging_guard = startup::init_logging(&configuration.logging_config())?;

    latchkey_server::metrics::init_metrics();

    let config = configuration.to_server_config();
    info!(
        recall_timeout = ?config.recall_timeout,
        reconnect_window = ?config.reconnect_window,
        greedy_enabled = config.greedy.enabled,
        promotion_threshold = config.greedy.promotion_threshold,
        "Starting Latchkey server"
    );

    let server = LockServer::bind(&config).await?;
    let shutdown = startup::wait_for_shutdown_signal().await;
    server.run(shutdown).await?;

    info!("Latchkey server stopped");
    Ok(())
}
