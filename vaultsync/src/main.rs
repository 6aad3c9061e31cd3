// vaultsync - per-user note sync data engine
// Maintenance daemon: opens the engine and runs its scheduled jobs until Ctrl-C

use anyhow::Context;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vaultsync::app::Engine;
use vaultsync::config::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vaultsync=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting vaultsync");

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VAULTSYNC_CONFIG").ok())
        .map(PathBuf::from);

    let config = EngineConfig::load(config_path.as_deref()).context("failed to load config")?;
    let engine = Engine::open(config).await.context("failed to open engine")?;

    engine
        .start_maintenance()
        .await
        .context("failed to start maintenance jobs")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    engine.shutdown().await.context("shutdown incomplete")?;
    Ok(())
}
