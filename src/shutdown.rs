//! Graceful shutdown of the control process.
//!
//! SIGTERM and SIGINT resolve the future returned by [`wait`], which first
//! tears down whatever tenant currently owns the GPU (stopping worker
//! processes through the usual STOP escalation) and then lets axum finish
//! in-flight requests and exit.

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

use crate::manager::SharedManager;

/// Waits for a termination signal, then releases every GPU tenant.
///
/// Meant to be handed to `axum::serve(...).with_graceful_shutdown`.
pub async fn wait(manager: SharedManager) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!(%err, "failed to register SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sigint) => sigint,
        Err(err) => {
            error!(%err, "failed to register SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    info!("shutting down, releasing gpu tenants");
    manager.lock().await.shutdown().await;
}
