//! Runs a [`Listener`] against a broker subscription.
//!
//! The runner owns everything between the broker and the handler:
//!
//! 1. Subscribe with the listener's [`SubscriptionOptions`]: durable name,
//!    queue group, manual ack, replay from the start, ack deadline.
//! 2. For each delivery, decode the payload into `L::Event`.
//!    - Decoding fails: the message is poison. It is logged at `error` and
//!      left unacknowledged; redelivery will fail the same way until an
//!      operator intervenes.
//! 3. Call [`Listener::on_message`].
//!    - `Ok`: acknowledge.
//!    - `Err`: log and leave unacknowledged for redelivery.
//! 4. On shutdown, stop taking deliveries, let in-flight handlers finish and
//!    close the subscription.
//!
//! [`SubscriptionOptions`]: ticketbus_core::SubscriptionOptions

use crate::metrics::ListenerMetrics;
use crate::shutdown::triggered;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use ticketbus_core::{
    Broker, BrokerError, Delivery, Event, Listener, QueueGroup, Subject,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Errors that stop a listener runner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// The subscription could not be established.
    #[error("Failed to subscribe to '{subject}' in queue group '{queue_group}': {source}")]
    Subscribe {
        /// Subject of the listener
        subject: Subject,
        /// Queue group of the listener
        queue_group: QueueGroup,
        /// Underlying broker failure
        #[source]
        source: BrokerError,
    },
}

/// What a runner did before it stopped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenerReport {
    /// Messages handled and acknowledged
    pub acked: u64,
    /// Messages whose handler returned an error
    pub handler_errors: u64,
    /// Messages that could not be decoded
    pub poison: u64,
    /// Handled messages whose acknowledgment failed
    pub ack_errors: u64,
}

#[derive(Default)]
struct Counters {
    acked: AtomicU64,
    handler_errors: AtomicU64,
    poison: AtomicU64,
    ack_errors: AtomicU64,
}

impl Counters {
    fn report(&self) -> ListenerReport {
        ListenerReport {
            acked: self.acked.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            ack_errors: self.ack_errors.load(Ordering::Relaxed),
        }
    }
}

/// Drives one listener until shutdown.
///
/// # Example
///
/// ```rust,ignore
/// let shutdown = Shutdown::new();
/// let handle = ListenerRunner::new(TicketCreatedListener::new(store), broker, shutdown.subscribe())
///     .spawn();
///
/// shutdown_signal().await;
/// shutdown.trigger();
/// let report = handle.await??;
/// ```
pub struct ListenerRunner<L: Listener> {
    listener: Arc<L>,
    broker: Arc<dyn Broker>,
    shutdown: watch::Receiver<bool>,
}

impl<L: Listener> ListenerRunner<L> {
    /// Create a runner for `listener`.
    #[must_use]
    pub fn new(listener: L, broker: Arc<dyn Broker>, shutdown: watch::Receiver<bool>) -> Self {
        Self::from_arc(Arc::new(listener), broker, shutdown)
    }

    /// Create a runner for a listener that is shared elsewhere.
    #[must_use]
    pub const fn from_arc(
        listener: Arc<L>,
        broker: Arc<dyn Broker>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            broker,
            shutdown,
        }
    }

    /// Run on a new task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<Result<ListenerReport, ListenerError>> {
        tokio::spawn(self.run())
    }

    /// Subscribe and process deliveries until shutdown or until the broker
    /// ends the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Subscribe`] if the subscription cannot be
    /// established. Per-message failures never end the run.
    pub async fn run(self) -> Result<ListenerReport, ListenerError> {
        let subject = self.listener.subject();
        let options = self.listener.subscription_options();
        let queue_group = options.queue_group.clone();
        let max_in_flight = options.max_in_flight.max(1);

        if *self.shutdown.borrow() {
            tracing::info!(subject = %subject, queue_group = %queue_group, "Shutdown before subscribing");
            return Ok(ListenerReport::default());
        }

        let mut subscription = self
            .broker
            .subscribe(subject, options)
            .await
            .map_err(|source| ListenerError::Subscribe {
                subject,
                queue_group: queue_group.clone(),
                source,
            })?;

        tracing::info!(
            subject = %subject,
            queue_group = %queue_group,
            durable_name = %subscription.options().durable_name,
            ack_wait_ms = u64::try_from(subscription.options().ack_wait.as_millis()).unwrap_or(u64::MAX),
            max_in_flight,
            "Listener subscribed"
        );

        let counters = Counters::default();
        let this = &self;
        let counters_ref = &counters;
        let queue_group_ref = &queue_group;

        (&mut subscription)
            .take_until(triggered(self.shutdown.clone()))
            .for_each_concurrent(max_in_flight, |item| async move {
                match item {
                    Ok(delivery) => this.dispatch(delivery, queue_group_ref, counters_ref).await,
                    Err(e) => {
                        ListenerMetrics::record_stream_error(subject);
                        tracing::warn!(
                            subject = %subject,
                            queue_group = %queue_group_ref,
                            error = %e,
                            "Error receiving delivery"
                        );
                    }
                }
            })
            .await;

        if let Err(e) = subscription.close().await {
            tracing::warn!(
                subject = %subject,
                queue_group = %queue_group,
                error = %e,
                "Failed to close subscription cleanly"
            );
        }

        let report = counters.report();
        tracing::info!(
            subject = %subject,
            queue_group = %queue_group,
            acked = report.acked,
            handler_errors = report.handler_errors,
            poison = report.poison,
            "Listener stopped"
        );
        Ok(report)
    }

    async fn dispatch(&self, delivery: Delivery, queue_group: &QueueGroup, counters: &Counters) {
        let (metadata, data, ack) = delivery.into_parts();
        let subject = metadata.subject;

        let event = match L::Event::decode(&data) {
            Ok(event) => event,
            Err(e) => {
                counters.poison.fetch_add(1, Ordering::Relaxed);
                ListenerMetrics::record_poison(subject);
                tracing::error!(
                    subject = %subject,
                    queue_group = %queue_group,
                    sequence = metadata.sequence,
                    delivery_attempt = metadata.delivery_attempt,
                    payload_len = data.len(),
                    error = %e,
                    "Poison message: payload does not decode, leaving unacknowledged"
                );
                return;
            }
        };

        tracing::debug!(
            subject = %subject,
            sequence = metadata.sequence,
            redelivered = metadata.redelivered,
            version = ?event.entity_version(),
            "Dispatching message"
        );

        match self.listener.on_message(event, &metadata).await {
            Ok(()) => match ack.ack().await {
                Ok(()) => {
                    counters.acked.fetch_add(1, Ordering::Relaxed);
                    ListenerMetrics::record_acked(subject);
                }
                Err(e) => {
                    counters.ack_errors.fetch_add(1, Ordering::Relaxed);
                    ListenerMetrics::record_ack_error(subject);
                    tracing::warn!(
                        subject = %subject,
                        sequence = metadata.sequence,
                        error = %e,
                        "Failed to acknowledge, message will be redelivered"
                    );
                }
            },
            Err(e) => {
                counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                ListenerMetrics::record_handler_error(subject);
                tracing::warn!(
                    subject = %subject,
                    queue_group = %queue_group,
                    sequence = metadata.sequence,
                    delivery_attempt = metadata.delivery_attempt,
                    error = %e,
                    "Handler failed, message left for redelivery"
                );
            }
        }
    }
}
