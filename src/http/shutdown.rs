//! Termination signal handling.
//!
//! SIGTERM and SIGINT both start a graceful shutdown of the worker pool:
//! listeners stop accepting, in-flight requests get the grace period, and
//! whatever is still running afterwards is aborted.

/// Resolves with the signal name once SIGTERM or Ctrl+C arrives.
///
/// If a handler cannot be installed that source is ignored and the other
/// still works; an error is logged.
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            "SIGINT"
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
            "SIGTERM"
        }
    }
}
