//! Graceful shutdown handling
//!
//! Turns termination signals into a [`CancellationToken`] that every
//! instance task watches.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Set up a shutdown signal handler
///
/// Spawns a task that cancels the returned token when SIGINT or SIGTERM
/// (Ctrl+C on Windows) arrives. If the signal handlers cannot be installed
/// the failure is logged and the token is only cancelled by its owner.
///
/// # Returns
/// * `CancellationToken` - Cancelled on shutdown request
pub fn setup_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => trigger.cancel(),
            Err(e) => error!("❌ Failed to install signal handlers: {}", e),
        }
    });

    token
}

/// Waits for the first termination signal.
///
/// # Errors
/// * Returns the I/O error from installing the platform signal handler
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("📡 SIGINT received - initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("📡 SIGTERM received - initiating graceful shutdown");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("📡 Ctrl+C received - initiating graceful shutdown");
    }

    Ok(())
}
