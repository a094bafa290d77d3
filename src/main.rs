//! Consumer wrapper health server
//!
//! Services embed the library and run their own consumers; this binary
//! serves the health endpoints for a deployment.

use std::sync::Arc;

use consumer_wrapper::api::{self, HealthState};
use consumer_wrapper::{logging, Config, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from environment
    let config = Config::from_env()?;

    // Initialize logging/tracing
    logging::init_tracing(&config.server.log_level, &config.server.environment)?;

    config.validate()?;
    config.log_config();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting consumer wrapper");

    let health = Arc::new(HealthState::new());
    api::create_server(&config.server, health, api::shutdown_signal()).await?;

    tracing::info!("Consumer wrapper shutdown complete");
    Ok(())
}
