use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What ends a consumer session gracefully, besides the caller's context.
#[derive(Debug, Clone, Default)]
pub enum ShutdownSource {
    /// SIGINT or SIGTERM delivered to the process.
    #[default]
    OsSignals,
    /// A token owned by the caller. Cancelling it is a broadcast to every lane.
    Token(CancellationToken),
}

/// Cancels `stop` when the source fires. The listener goes away once `stop` is cancelled.
pub(crate) fn bridge(source: &ShutdownSource, stop: &CancellationToken) {
    let stop = stop.clone();
    match source {
        ShutdownSource::OsSignals => {
            tokio::spawn(async move {
                tokio::select! {
                    _ = wait_for_shutdown_signal() => stop.cancel(),
                    _ = stop.cancelled() => {}
                }
            });
        }
        ShutdownSource::Token(token) => {
            if token.is_cancelled() {
                stop.cancel();
                return;
            }
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("shutdown requested");
                        stop.cancel();
                    }
                    _ = stop.cancelled() => {}
                }
            });
        }
    }
}

async fn interrupt() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received SIGINT"),
        Err(e) => {
            warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            return interrupt().await;
        }
    };

    tokio::select! {
        _ = interrupt() => {},
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    interrupt().await;
}
