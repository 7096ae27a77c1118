//! Listeners that keep the orders-side ticket replicas current.
//!
//! All three ticket listeners share one queue group, so each ticket event is
//! applied by exactly one instance of the service. They never touch the
//! repository directly; every write goes through the [`VersionGuardedStore`].

use crate::config::ListenerConfig;
use crate::ticket::TicketReplica;
use async_trait::async_trait;
use std::sync::Arc;
use ticketbus_core::events::{StreamHealthPing, TicketCreated, TicketDeleted, TicketUpdated};
use ticketbus_core::{HandlerError, Listener, MessageMetadata, QueueGroup, SubscriptionOptions};
use ticketbus_runtime::{ApplyOutcome, VersionGuardedStore};

/// Store shared by the ticket listeners.
pub type TicketStore = VersionGuardedStore<TicketReplica>;

fn options(settings: &ListenerConfig, queue_group: QueueGroup) -> SubscriptionOptions {
    SubscriptionOptions::new(queue_group)
        .with_ack_wait(settings.ack_wait)
        .with_max_in_flight(settings.max_in_flight)
}

/// Applies `ticket:created`.
#[derive(Debug)]
pub struct TicketCreatedListener {
    store: Arc<TicketStore>,
    settings: ListenerConfig,
}

impl TicketCreatedListener {
    /// Listener writing through `store`.
    #[must_use]
    pub const fn new(store: Arc<TicketStore>, settings: ListenerConfig) -> Self {
        Self { store, settings }
    }
}

#[async_trait]
impl Listener for TicketCreatedListener {
    type Event = TicketCreated;

    fn queue_group(&self) -> QueueGroup {
        self.settings.queue_group.clone()
    }

    fn subscription_options(&self) -> SubscriptionOptions {
        options(&self.settings, self.queue_group())
    }

    async fn on_message(&self, data: TicketCreated, msg: &MessageMetadata) -> Result<(), HandlerError> {
        let outcome = self.store.apply_created(TicketReplica::from(&data)).await?;
        if let ApplyOutcome::DuplicateCreate { current } = outcome {
            tracing::debug!(sequence = msg.sequence, id = %data.id, current = %current, "Ticket already replicated");
        }
        Ok(())
    }
}

/// Applies `ticket:updated` under the version guard.
///
/// An update already reflected in the replica (a redelivery) is acknowledged
/// without effect. Any other rejection, such as an update that overtook its
/// predecessor, is left unacknowledged so the broker redelivers it after the
/// predecessor has been applied.
#[derive(Debug)]
pub struct TicketUpdatedListener {
    store: Arc<TicketStore>,
    settings: ListenerConfig,
}

impl TicketUpdatedListener {
    /// Listener writing through `store`.
    #[must_use]
    pub const fn new(store: Arc<TicketStore>, settings: ListenerConfig) -> Self {
        Self { store, settings }
    }
}

#[async_trait]
impl Listener for TicketUpdatedListener {
    type Event = TicketUpdated;

    fn queue_group(&self) -> QueueGroup {
        self.settings.queue_group.clone()
    }

    fn subscription_options(&self) -> SubscriptionOptions {
        options(&self.settings, self.queue_group())
    }

    async fn on_message(&self, data: TicketUpdated, msg: &MessageMetadata) -> Result<(), HandlerError> {
        let TicketUpdated {
            id,
            expected_version,
            title,
            price,
            ..
        } = data;

        let result = self
            .store
            .apply_updated(&id, expected_version, move |ticket| {
                ticket.title = title;
                ticket.price = price;
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_superseded() => {
                tracing::debug!(
                    sequence = msg.sequence,
                    attempt = msg.delivery_attempt,
                    id = %id,
                    "Update already applied"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Applies `ticket:deleted`.
#[derive(Debug)]
pub struct TicketDeletedListener {
    store: Arc<TicketStore>,
    settings: ListenerConfig,
}

impl TicketDeletedListener {
    /// Listener writing through `store`.
    #[must_use]
    pub const fn new(store: Arc<TicketStore>, settings: ListenerConfig) -> Self {
        Self { store, settings }
    }
}

#[async_trait]
impl Listener for TicketDeletedListener {
    type Event = TicketDeleted;

    fn queue_group(&self) -> QueueGroup {
        self.settings.queue_group.clone()
    }

    fn subscription_options(&self) -> SubscriptionOptions {
        options(&self.settings, self.queue_group())
    }

    async fn on_message(&self, data: TicketDeleted, _msg: &MessageMetadata) -> Result<(), HandlerError> {
        self.store.apply_deleted(&data.id).await?;
        Ok(())
    }
}

/// Logs `stream:health-ping` probes.
///
/// Joins its own queue group so every service answers a probe once.
#[derive(Debug)]
pub struct StreamHealthListener {
    settings: ListenerConfig,
}

impl StreamHealthListener {
    /// Listener using the ack deadline of `settings`.
    #[must_use]
    pub const fn new(settings: ListenerConfig) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Listener for StreamHealthListener {
    type Event = StreamHealthPing;

    fn queue_group(&self) -> QueueGroup {
        QueueGroup::new(QueueGroup::STREAM_HEALTH)
    }

    fn durable_name(&self) -> String {
        format!("{}-{}", self.settings.queue_group, QueueGroup::STREAM_HEALTH)
    }

    fn subscription_options(&self) -> SubscriptionOptions {
        options(&self.settings, self.queue_group()).with_durable_name(self.durable_name())
    }

    async fn on_message(&self, data: StreamHealthPing, msg: &MessageMetadata) -> Result<(), HandlerError> {
        tracing::info!(
            sequence = msg.sequence,
            subject = %msg.subject,
            message = %data.message,
            "{}: Processing {}",
            msg.sequence,
            msg.subject
        );
        Ok(())
    }
}
