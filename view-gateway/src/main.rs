//! View Gateway - Main entry point.

use anyhow::Result;
use view_common::config::Config;
use view_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load_with_env()?;

    // Initialize logging
    init_logging(&config.observability.log_level, &config.observability.log_format);

    tracing::info!("Session View gateway v{}", env!("CARGO_PKG_VERSION"));

    view_gateway::start_server(&config).await
}
