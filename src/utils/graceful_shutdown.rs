use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Coordinates process shutdown.
///
/// A single [`CancellationToken`] is cancelled on SIGINT/SIGTERM (or
/// [`trigger_shutdown`](Self::trigger_shutdown)). The listener, the config
/// watcher and every registry watch loop hold child tokens of it.
#[derive(Debug, Clone)]
pub struct GracefulShutdown {
    token: CancellationToken,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new GracefulShutdown manager with default 30-second drain timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            drain_timeout,
        }
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token cancelled on shutdown, or earlier by its own holder.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Upper bound on how long in-flight requests may drain.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Manually trigger shutdown
    pub fn trigger_shutdown(&self, reason: &str) {
        if !self.token.is_cancelled() {
            tracing::info!(reason, "Shutdown triggered");
            self.token.cancel();
        }
    }

    /// Wait for SIGINT or SIGTERM, then cancel the token. Returns early if
    /// shutdown was triggered some other way.
    pub async fn run_signal_handler(&self) {
        tracing::debug!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => match result {
                Ok(()) => self.trigger_shutdown("SIGINT"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for SIGINT"),
            },
            _ = wait_for_sigterm() => self.trigger_shutdown("SIGTERM"),
            _ = self.token.cancelled() => {}
        }
    }

    /// Resolves once shutdown has been initiated.
    pub async fn wait_for_shutdown_signal(&self) {
        self.token.cancelled().await;
        tracing::info!("Shutting down gracefully");
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
}
