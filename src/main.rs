// =============================================================================
// Pulse Engine — Main Entry Point
// =============================================================================
//
// Boots the scoring service: loads the runtime config, replays the weight
// ledger, starts the reinforcement scheduler and serves the REST API until
// Ctrl+C.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod calibration;
mod error;
mod reinforcement;
mod runtime_config;
mod scoring;
mod signals;
mod simulation;
mod trend;
mod types;

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::RuntimeConfig;
use crate::scoring::{WeightLedger, WeightStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Pulse Engine starting up");

    let config_path =
        std::env::var("PULSE_CONFIG_PATH").unwrap_or_else(|_| "runtime_config.json".into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Extra tenants from env are seeded alongside the configured ones.
    if let Ok(tenants) = std::env::var("PULSE_TENANTS") {
        for t in tenants.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if !config.tenants.iter().any(|c| c == t) {
                config.tenants.push(t.to_string());
            }
        }
    }
    info!(tenants = ?config.tenants, "Configured tenants");

    // ── 2. Weight store ──────────────────────────────────────────────────
    let ledger_path =
        std::env::var("PULSE_WEIGHT_LEDGER").unwrap_or_else(|_| "weight_ledger.jsonl".into());
    let ledger = WeightLedger::new(&ledger_path);
    info!(path = %ledger.path().display(), "Replaying weight ledger");
    let store = WeightStore::open(ledger)?;
    info!(tenants = store.tenants().len(), "Weight ledger replayed");

    // ── 3. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, store)?);

    // ── 4. Reinforcement scheduler ───────────────────────────────────────
    tokio::spawn(reinforcement::run_scheduler(state.clone()));

    // ── 5. API server ────────────────────────────────────────────────────
    let bind_addr =
        std::env::var("PULSE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            warn!("Shutdown signal received — stopping gracefully");
        })
        .await?;

    // ── 6. Persist config ────────────────────────────────────────────────
    if let Err(e) = state.runtime_config.read().save(&config_path) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Pulse Engine shut down complete.");
    Ok(())
}
