//! Wiring of the replication listeners into one process.

use crate::config::ListenerConfig;
use crate::listeners::{
    StreamHealthListener, TicketCreatedListener, TicketDeletedListener, TicketStore,
    TicketUpdatedListener,
};
use crate::ticket::TicketReplica;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use ticketbus_core::{Broker, Listener, ReplicaRepository};
use ticketbus_runtime::{ListenerError, ListenerReport, ListenerRunner, Shutdown, VersionGuardedStore};
use tokio::task::JoinHandle;

type RunnerHandle = JoinHandle<Result<ListenerReport, ListenerError>>;

/// Why the process stopped abnormally.
#[derive(Error, Debug)]
pub enum AppError {
    /// A listener could not subscribe.
    #[error(transparent)]
    Listener(#[from] ListenerError),

    /// A listener task panicked or was cancelled.
    #[error("Listener '{listener}' task failed: {reason}")]
    Join {
        /// Subject of the listener
        listener: &'static str,
        /// Join failure
        reason: String,
    },

    /// A listener ended while no shutdown was requested.
    #[error("Listener '{listener}' stopped unexpectedly")]
    ListenerStopped {
        /// Subject of the listener
        listener: &'static str,
    },

    /// Listeners did not drain within the grace period.
    #[error("Listeners did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

/// The orders-side replication process: one runner per ticket subject plus
/// the stream health probe.
pub struct ReplicationApp {
    store: Arc<TicketStore>,
    shutdown: Shutdown,
    runners: Vec<(&'static str, RunnerHandle)>,
}

impl ReplicationApp {
    /// Spawn all listeners against `broker`, writing replicas to `repository`.
    #[must_use]
    pub fn start(
        broker: Arc<dyn Broker>,
        repository: Arc<dyn ReplicaRepository<TicketReplica>>,
        settings: &ListenerConfig,
    ) -> Self {
        let store = Arc::new(VersionGuardedStore::new(repository).with_kind("ticket"));
        let shutdown = Shutdown::new();

        let runners = vec![
            spawn(TicketCreatedListener::new(Arc::clone(&store), settings.clone()), &broker, &shutdown),
            spawn(TicketUpdatedListener::new(Arc::clone(&store), settings.clone()), &broker, &shutdown),
            spawn(TicketDeletedListener::new(Arc::clone(&store), settings.clone()), &broker, &shutdown),
            spawn(StreamHealthListener::new(settings.clone()), &broker, &shutdown),
        ];
        tracing::info!(
            queue_group = %settings.queue_group,
            listeners = runners.len(),
            "Replication listeners started"
        );

        Self {
            store,
            shutdown,
            runners,
        }
    }

    /// Store holding the ticket replicas.
    #[must_use]
    pub fn store(&self) -> Arc<TicketStore> {
        Arc::clone(&self.store)
    }

    /// Run until `signal` completes or a listener stops on its own, then
    /// drain every listener within `grace`.
    ///
    /// Returns the report of each listener, keyed by subject.
    ///
    /// # Errors
    ///
    /// - [`AppError::Listener`] if a listener could not subscribe
    /// - [`AppError::ListenerStopped`] if a listener ended before `signal`
    /// - [`AppError::Join`] if a listener task panicked
    /// - [`AppError::ShutdownTimeout`] if draining took longer than `grace`
    pub async fn run(
        self,
        signal: impl Future<Output = ()>,
        grace: Duration,
    ) -> Result<Vec<(&'static str, ListenerReport)>, AppError> {
        let Self {
            shutdown,
            mut runners,
            ..
        } = self;

        let early = {
            let first_exit = futures::future::select_all(runners.iter_mut().map(|(_, handle)| handle));
            tokio::select! {
                () = signal => None,
                (result, index, _) = first_exit => Some((index, result)),
            }
        };

        let early_error = early.map(|(index, result)| {
            let (listener, _) = runners.remove(index);
            let error = match result {
                Ok(Ok(_)) => AppError::ListenerStopped { listener },
                Ok(Err(e)) => AppError::Listener(e),
                Err(e) => AppError::Join {
                    listener,
                    reason: e.to_string(),
                },
            };
            tracing::error!(listener, error = %error, "Listener exited; shutting down");
            error
        });

        tracing::info!("Stopping listeners");
        shutdown.trigger();

        let drained = tokio::time::timeout(
            grace,
            futures::future::join_all(
                runners
                    .into_iter()
                    .map(|(listener, handle)| async move { (listener, handle.await) }),
            ),
        )
        .await
        .map_err(|_| {
            tracing::warn!(grace = ?grace, "Listeners still busy after grace period");
            AppError::ShutdownTimeout(grace)
        })?;

        if let Some(error) = early_error {
            return Err(error);
        }

        let mut reports = Vec::with_capacity(drained.len());
        for (listener, result) in drained {
            let report = result
                .map_err(|e| AppError::Join {
                    listener,
                    reason: e.to_string(),
                })??;
            tracing::info!(
                listener,
                acked = report.acked,
                handler_errors = report.handler_errors,
                poison = report.poison,
                "Listener stopped"
            );
            reports.push((listener, report));
        }
        Ok(reports)
    }
}

impl std::fmt::Debug for ReplicationApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationApp")
            .field("listeners", &self.runners.iter().map(|(name, _)| *name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn spawn<L: Listener>(
    listener: L,
    broker: &Arc<dyn Broker>,
    shutdown: &Shutdown,
) -> (&'static str, RunnerHandle) {
    let name = listener.subject().as_str();
    let handle = ListenerRunner::new(listener, Arc::clone(broker), shutdown.subscribe()).spawn();
    (name, handle)
}
