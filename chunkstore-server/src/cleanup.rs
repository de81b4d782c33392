use std::time::SystemTime;

use anyhow::{Context, Result};
use chunkstore_service::SweepReport;
use tokio::signal::unix::SignalKind;

use crate::state::ServiceState;

/// Runs the chunkstore process until termination is requested.
///
/// If this process is configured to own the cleanup sweep, the sweep runs periodically in the
/// background. An ongoing sweep is completed before shutting down.
pub async fn run(state: ServiceState) -> Result<()> {
    tracing::info!("Starting chunkstore");

    let scheduler = if state.config.cleanup.enabled {
        let scheduler = state.cleanup_scheduler();
        Some(tokio::spawn(async move {
            let guard = elegant_departure::get_shutdown_guard();
            scheduler.run_until(guard.wait()).await;
        }))
    } else {
        tracing::info!("cleanup sweep is disabled for this process");
        None
    };

    elegant_departure::tokio::depart()
        .on_termination()
        .on_sigint()
        .on_signal(SignalKind::hangup())
        .on_signal(SignalKind::quit())
        .await;

    if let Some(scheduler) = scheduler {
        scheduler.await.context("cleanup scheduler failed")?;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Runs a single cleanup sweep.
pub async fn sweep(state: ServiceState) -> Result<SweepReport> {
    state
        .cleanup_scheduler()
        .run_once(SystemTime::now())
        .await
        .context("cleanup sweep failed")
}
