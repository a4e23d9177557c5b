//! Graceful shutdown coordinator.
//!
//! Provides signal-driven shutdown with a bounded grace period:
//! - `SIGINT` / `SIGTERM` → cancel the root token (closes listeners,
//!   connections and supervisors), then wait for cleanup scripts
//!
//! Uses a root `CancellationToken`; every proxy, connection and restart
//! attempt derives a child token from it.

use std::future::Future;
use std::time::Duration;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why shutdown started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl-C).
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// The root token was cancelled programmatically.
    Requested,
}

/// Coordinator for graceful shutdown with a cleanup grace period.
pub struct GracefulShutdown {
    /// Root of every cancellation token in the run.
    root: CancellationToken,

    /// How long cleanup may take after cancellation.
    grace: Duration,
}

impl GracefulShutdown {
    /// Create a new shutdown coordinator.
    pub fn new(grace: Duration) -> Self {
        Self {
            root: CancellationToken::new(),
            grace,
        }
    }

    /// The root token. Cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Start shutdown programmatically.
    pub fn trigger(&self) {
        self.root.cancel();
    }

    /// Install the SIGINT/SIGTERM handlers.
    ///
    /// Until this is called the default signal action applies, so call it
    /// before starting anything that must be shut down gracefully.
    pub fn listen(&self) -> std::io::Result<ShutdownSignals> {
        Ok(ShutdownSignals {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            root: self.root.clone(),
        })
    }

    /// Install the handlers and wait for SIGINT, SIGTERM or a programmatic
    /// trigger.
    pub async fn wait_for_signal(&self) -> std::io::Result<ShutdownSignal> {
        Ok(self.listen()?.recv().await)
    }

    /// Cancel the root token and wait for `stopped` for at most the grace
    /// period.
    ///
    /// Returns `true` if `stopped` completed in time, `false` if the grace
    /// period expired.
    pub async fn drain<F>(&self, stopped: F) -> bool
    where
        F: Future<Output = ()>,
    {
        self.root.cancel();

        info!(grace_secs = self.grace.as_secs(), "Waiting for services to stop");

        tokio::select! {
            _ = stopped => {
                info!("All services stopped cleanly");
                true
            }
            _ = tokio::time::sleep(self.grace) => {
                warn!(
                    grace_secs = self.grace.as_secs(),
                    "Grace period expired, exiting with services still stopping"
                );
                false
            }
        }
    }
}

/// Installed signal handlers, see [`GracefulShutdown::listen`].
pub struct ShutdownSignals {
    sigint: Signal,
    sigterm: Signal,
    root: CancellationToken,
}

impl ShutdownSignals {
    /// Wait for SIGINT, SIGTERM or cancellation of the root token.
    pub async fn recv(&mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.sigint.recv() => {
                info!("Received SIGINT, shutting down");
                ShutdownSignal::Interrupt
            }
            _ = self.sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                ShutdownSignal::Terminate
            }
            _ = self.root.cancelled() => ShutdownSignal::Requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_signal_wait() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(5));
        let token = shutdown.token();
        assert!(!token.is_cancelled());

        shutdown.trigger();
        assert!(token.is_cancelled());
        assert_eq!(
            shutdown.wait_for_signal().await.unwrap(),
            ShutdownSignal::Requested
        );
    }

    #[tokio::test]
    async fn test_listen_before_trigger() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(5));
        let mut signals = shutdown.listen().unwrap();

        let waiter = tokio::spawn(async move { signals.recv().await });
        shutdown.trigger();
        assert_eq!(waiter.await.unwrap(), ShutdownSignal::Requested);
    }

    #[tokio::test]
    async fn test_drain_completes_when_stopped() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(5));
        let token = shutdown.token();

        let drained = shutdown.drain(async move { token.cancelled().await }).await;
        assert!(drained);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout() {
        let shutdown = GracefulShutdown::new(Duration::from_millis(100));

        let drained = shutdown.drain(std::future::pending::<()>()).await;
        assert!(!drained);
        assert!(shutdown.token().is_cancelled());
    }
}
