//! Long-running polling service.

use super::startup::ServiceContext;
use eyre::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Poll the oracle and run cycles until ctrl-c.
pub async fn run_service(ctx: &ServiceContext) -> Result<()> {
    let dispatcher = ctx.dispatcher();
    let schedule = ctx.poll_schedule();
    info!(
        cadence = ?ctx.config.cadence,
        metrics = ?dispatcher.metrics(),
        cache_sets = ctx.storage.registry.active().len(),
        "service starting"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("shutdown signal received; stopping after the current cycle");
                let _ = stop_tx.send(true);
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for shutdown signal");
                // Keep the sender alive so the poll loop keeps running.
                std::future::pending::<()>().await;
            }
        }
    });

    dispatcher
        .poll(Arc::clone(&ctx.oracle), schedule, stop_rx)
        .await
}
