//! Subscription options and consumer group identity.

use crate::subject::QueueGroup;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default time the broker waits for an acknowledgment before redelivering.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Default upper bound of unacknowledged deliveries per subscriber.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1024;

/// How a listener's subscription is set up on the broker.
///
/// The defaults match what every replicated consumer in the marketplace uses:
/// manual acknowledgment, replay of the whole retained log for a new durable
/// subscription, a 30 second ack deadline and up to 1024 messages in flight.
///
/// A delivery waiting for redelivery only occupies its own slot, so the
/// bound must leave room for messages stored behind it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Durable name; the broker tracks delivery progress under it.
    pub durable_name: String,
    /// Queue group the subscription joins.
    pub queue_group: QueueGroup,
    /// Whether the broker waits for explicit acknowledgments.
    pub manual_ack: bool,
    /// Whether a new durable subscription starts from the first retained message.
    pub deliver_all_available: bool,
    /// Deadline after which an unacknowledged delivery is redelivered.
    pub ack_wait: Duration,
    /// Upper bound of unacknowledged deliveries handed to this subscriber.
    pub max_in_flight: usize,
}

impl SubscriptionOptions {
    /// Options for a durable subscription in `queue_group`.
    ///
    /// The durable name defaults to the queue group name so every instance of a
    /// service resumes the same delivery progress.
    #[must_use]
    pub fn new(queue_group: QueueGroup) -> Self {
        Self {
            durable_name: queue_group.as_str().to_string(),
            queue_group,
            manual_ack: true,
            deliver_all_available: true,
            ack_wait: DEFAULT_ACK_WAIT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Override the durable name.
    #[must_use]
    pub fn with_durable_name(mut self, name: impl Into<String>) -> Self {
        self.durable_name = name.into();
        self
    }

    /// Override the ack deadline.
    #[must_use]
    pub const fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Override the number of deliveries processed concurrently.
    ///
    /// Zero is treated as one.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Start new durable subscriptions at the end of the log instead of the start.
    #[must_use]
    pub const fn only_new_messages(mut self) -> Self {
        self.deliver_all_available = false;
        self
    }
}

/// Error raised by an invalid [`ConsumerGroupIdentity`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid consumer identity: {field} must not be empty")]
pub struct InvalidIdentity {
    /// Name of the offending field
    pub field: &'static str,
}

/// Identity of one process in one logical replicated-service subscription.
///
/// All instances of a service share `cluster_id` and `queue_group`; `client_id`
/// must be unique per process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerGroupIdentity {
    cluster_id: String,
    client_id: String,
    queue_group: QueueGroup,
}

impl ConsumerGroupIdentity {
    /// Build and validate an identity.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidIdentity`] if any field is blank.
    pub fn new(
        cluster_id: impl Into<String>,
        client_id: impl Into<String>,
        queue_group: impl Into<QueueGroup>,
    ) -> Result<Self, InvalidIdentity> {
        let identity = Self {
            cluster_id: cluster_id.into(),
            client_id: client_id.into(),
            queue_group: queue_group.into(),
        };
        if identity.cluster_id.trim().is_empty() {
            return Err(InvalidIdentity { field: "cluster_id" });
        }
        if identity.client_id.trim().is_empty() {
            return Err(InvalidIdentity { field: "client_id" });
        }
        if identity.queue_group.as_str().trim().is_empty() {
            return Err(InvalidIdentity { field: "queue_group" });
        }
        Ok(identity)
    }

    /// A client id unique to this process: `"{service}-{uuid}"`.
    #[must_use]
    pub fn unique_client_id(service: &str) -> String {
        format!("{service}-{}", uuid::Uuid::new_v4().simple())
    }

    /// Broker cluster this process belongs to.
    #[must_use]
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Per-process client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Shared queue group.
    #[must_use]
    pub const fn queue_group(&self) -> &QueueGroup {
        &self.queue_group
    }
}
