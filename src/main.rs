//! swipe-dl daemon
//!
//! Loads configuration from the path given as the first argument (or
//! `SWIPE_DL_CONFIG`), overlays secrets from the environment, then runs the
//! orchestrator and the REST API until SIGTERM or Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;
use swipe_dl::{Config, Orchestrator, api};
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SWIPE_DL_CONFIG").ok())
        .map(PathBuf::from);

    let mut config = match &path {
        Some(path) => Config::from_json_file(path)?,
        None => {
            tracing::warn!("no configuration file given; using defaults");
            Config::default()
        }
    };
    config.apply_env_overrides();

    let orchestrator = Arc::new(Orchestrator::new(config.clone()).await?);
    orchestrator.start();

    api::start_api_server(
        orchestrator.clone(),
        Arc::new(config),
        swipe_dl::shutdown_signal(),
    )
    .await?;

    orchestrator.shutdown().await?;
    Ok(())
}
