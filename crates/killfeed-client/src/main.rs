//! # Killfeed
//!
//! Command line client for the killmail feed.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! killfeed
//!
//! # Run with custom config
//! killfeed /path/to/killfeed.toml
//!
//! # Run with environment variables
//! KILLFEED_SERVER_URL=wss://kills.example.com KILLFEED_SYSTEMS=30000142,30002187 killfeed
//! ```

mod config;
mod metrics;
mod runner;

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "killfeed=info,killfeed_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = config::Config::load(path.as_deref())?;

    tracing::info!(
        "Starting Killfeed client for {} ({} systems)",
        config.server_url,
        config.systems.len()
    );

    // Initialize metrics
    metrics::init_metrics();

    runner::run(config).await?;

    Ok(())
}
