//! Shutdown signal handling.

use tracing::warn;

/// Resolves when SIGINT (Ctrl+C) or, on Unix, SIGTERM arrives.
pub async fn wait_for_shutdown_signal() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

/// Arms a second-signal handler that exits the process immediately, for
/// when a graceful shutdown hangs.
pub fn arm_forced_exit() {
    tokio::spawn(async {
        if wait_for_shutdown_signal().await.is_ok() {
            warn!("second shutdown signal received, exiting immediately");
            std::process::exit(1);
        }
    });
}
