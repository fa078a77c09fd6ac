//! # Roster Server
//!
//! Presence and fan-out server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file in the working directory
//! roster
//!
//! # Run with environment variables
//! ROSTER_PORT=8080 ROSTER_AUTH__SECRET=change-me ROSTER_STORE__BACKEND=redis roster
//! ```

use anyhow::Result;
use roster_server::{config::Config, metrics, run_server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roster=debug,roster_core=debug,roster_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!(
        node = %config.node(),
        backend = ?config.store.backend,
        "Starting roster server on {}:{}",
        config.host,
        config.port
    );

    metrics::init_metrics();

    run_server(config).await
}
