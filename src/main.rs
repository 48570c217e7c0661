// =============================================================================
// sigfuse — Main Entry Point
// =============================================================================
//
// Starts in Demo account mode unless the config says otherwise. Live mode
// also needs SIGFUSE_API_KEY / SIGFUSE_API_SECRET in the environment.
// =============================================================================

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sigfuse::{App, AppConfig};

const CONFIG_PATH: &str = "sigfuse.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("sigfuse starting up");

    // ── 2. Config ────────────────────────────────────────────────────────
    let config_path = std::env::var("SIGFUSE_CONFIG").unwrap_or_else(|_| CONFIG_PATH.to_string());
    let mut config = AppConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    config.apply_env_overrides();
    config.validate()?;

    info!(
        symbols = ?config.runtime.symbols,
        account_mode = %config.runtime.account_mode,
        fusion_interval_ms = config.fusion.fusion_interval_ms,
        "configuration ready"
    );

    // ── 3. Wire and start ────────────────────────────────────────────────
    let app = App::build(config)?;
    app.start();

    // ── 4. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");
    app.shutdown().await;

    Ok(())
}
