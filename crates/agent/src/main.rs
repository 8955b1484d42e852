//! Reclaimer - idle-memory reclamation agent
//!
//! Runs next to the virtualization management plane and reclaims idle
//! guest memory from a cluster on request (or once at startup).

use anyhow::{Context, Result};
use reclaim_lib::{
    health::{components, HealthRegistry},
    inventory::InMemoryFleet,
    observability::{ReclaimerMetrics, StructuredLogger},
    RunTracker,
};
use reclaimer_agent::{api, config::ReclaimerConfig, runner::RunLauncher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long shutdown waits for a cancelled run to clear its limit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting reclaimer");

    let config = ReclaimerConfig::load()?;
    info!(
        cluster = %config.cluster_name,
        idle_threshold = config.thresholds.idle_threshold,
        stall_rounds = config.thresholds.stall_rounds,
        poll_interval_secs = config.thresholds.poll_interval.as_secs(),
        "Reclaimer configured"
    );

    let inventory_file = config
        .inventory_file
        .as_deref()
        .context("inventory_file must be set (RECLAIMER_INVENTORY_FILE)")?;
    let fleet = Arc::new(InMemoryFleet::from_file(inventory_file)?);

    let health_registry = HealthRegistry::new();
    health_registry.register(components::CONTROLLER).await;
    health_registry.register(components::MANAGEMENT_PLANE).await;

    let metrics = ReclaimerMetrics::new();

    let logger = StructuredLogger::new(&config.cluster_name);
    logger.log_startup(AGENT_VERSION);

    let tracker = RunTracker::new();
    let launcher = RunLauncher::new(
        fleet,
        config.thresholds.clone(),
        &config.cluster_name,
        tracker.clone(),
        health_registry.clone(),
    );
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        launcher.clone(),
    ));

    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    if config.run_on_start {
        match tracker.try_begin() {
            Some(guard) => {
                launcher.launch(guard).await?;
            }
            None => warn!("Run on start skipped, a run is already active"),
        }
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            let reason = match result {
                Ok(Ok(())) => "API server stopped".to_string(),
                Ok(Err(e)) => format!("API server failed: {}", e),
                Err(e) => format!("API server panicked: {}", e),
            };
            error!(reason = %reason, "API server exited");
            logger.log_shutdown(&reason);
        }
    }

    if !launcher.shutdown(SHUTDOWN_GRACE).await {
        warn!("In-flight run did not stop within the shutdown grace period");
    }
    info!("Shutting down");

    Ok(())
}
