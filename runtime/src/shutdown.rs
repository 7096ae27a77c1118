//! Shutdown coordination for listener runners.
//!
//! One [`Shutdown`] is created per process. Every runner holds a receiver
//! from [`Shutdown::subscribe`]; triggering it makes the runners stop taking
//! deliveries, finish what is in flight and close their subscriptions.

use tokio::sync::watch;

/// Broadcasts the shutdown request to all runners.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Create an untriggered shutdown signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Receiver to hand to a runner.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Ask every runner to stop.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
        tracing::info!(receivers = self.tx.receiver_count(), "Shutdown requested");
    }

    /// Whether [`Shutdown::trigger`] has been called.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once `rx` reports shutdown or its sender is gone.
pub async fn triggered(mut rx: watch::Receiver<bool>) {
    // A dropped sender can never un-trigger, so it counts as shutdown.
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Wait for Ctrl+C or SIGTERM.
///
/// If the SIGTERM handler cannot be installed only Ctrl+C is awaited.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Received Ctrl+C");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM");
                    }
                }
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to register SIGTERM handler");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to wait for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C");
}
