//! # Huddle Server
//!
//! Room-based realtime messaging gateway.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! huddle
//!
//! # Run with a specific config file
//! HUDDLE_CONFIG=/path/to/huddle.toml huddle
//!
//! # Override single settings from the environment
//! HUDDLE_PORT=8080 HUDDLE_LIMITS__MAX_ROOMS=500 huddle
//! ```

mod auth;
mod config;
mod metrics;
mod server;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,huddle_core=debug,huddle_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Huddle server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    server::run_server(config).await?;

    Ok(())
}
