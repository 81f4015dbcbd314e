use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long connections get to unwind after shutdown is requested.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Coordinates shutdown of the relay.
///
/// One `CancellationToken` fans out to everything: the RTMP listener stops
/// accepting, each connection's child token cancels (unblocking socket I/O
/// and running the session cleanups), and the API server finishes its
/// in-flight requests. `drain_until` then gives the connection registry a
/// bounded window to empty before the process exits.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// A clone of the root token for tasks to listen on.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Broadcast shutdown to every listening task.
    pub fn shutdown(&self) {
        info!("stopping RTMP connections and API server");
        self.token.cancel();
    }

    /// Block until SIGINT or SIGTERM arrives, then broadcast shutdown.
    pub async fn wait_for_signal(&self) {
        let signal = tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = terminate() => "SIGTERM",
        };
        info!(signal, "shutdown requested");
        self.shutdown();
    }

    /// Poll `drained` until it reports true or `DRAIN_TIMEOUT` passes.
    /// Returns whether the drain completed in time.
    pub async fn drain_until(&self, mut drained: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while !drained() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        true
    }
}

async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            // SIGINT still works; park this branch instead of failing
            warn!(error = %e, "SIGTERM handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_broadcasts_to_cloned_tokens() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();
        assert!(!token.is_cancelled());

        coordinator.shutdown();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_until_honors_the_deadline() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.drain_until(|| true).await);
        assert!(!coordinator.drain_until(|| false).await);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_until_observes_late_completion() {
        let coordinator = ShutdownCoordinator::new();
        let mut polls = 0;
        let done = coordinator
            .drain_until(|| {
                polls += 1;
                polls > 3
            })
            .await;
        assert!(done);
    }
}
