//! Termination signal wiring.
//!
//! Each transport owns its shutdown broadcast channel; this module
//! forwards SIGTERM/SIGINT into that channel so a signal and a
//! programmatic `stop()` travel the same path. The listener runs for
//! the life of the process and fires at most once.

use tokio::sync::broadcast;
use tracing::{info, warn};

/// Forward the first termination signal into `shutdown_tx`.
///
/// Returns the listener task handle. The handle can be dropped; the
/// listener keeps running detached.
#[cfg(unix)]
pub fn forward_signals(shutdown_tx: broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                return;
            },
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot listen for SIGINT: {}", e);
                return;
            },
        };

        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        info!(signal = name, "Termination signal received, shutting down");

        if shutdown_tx.send(()).is_err() {
            // Every subscriber is already gone; nothing left to stop.
            warn!(signal = name, "Shutdown channel had no subscribers");
        }
    })
}

/// Windows only delivers Ctrl+C; the contract is the same.
#[cfg(windows)]
pub fn forward_signals(shutdown_tx: broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            return;
        }
        info!(signal = "Ctrl+C", "Termination signal received, shutting down");

        if shutdown_tx.send(()).is_err() {
            warn!("Shutdown channel had no subscribers");
        }
    })
}
