//! Subject names and queue groups shared by every service on the bus.
//!
//! A [`Subject`] names one durable channel on the broker. The set is closed:
//! adding a new kind of event means adding a variant here and a payload type
//! in [`crate::events`] that binds to it through [`crate::event::Event::SUBJECT`].
//!
//! [`QueueGroup`] names the set of replicated instances of one service that
//! share a subscription. The broker hands each message of a subject to exactly
//! one member of a queue group.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when parsing an unknown subject name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown subject: {0}")]
pub struct UnknownSubject(String);

/// A named event channel on the broker.
///
/// # Examples
///
/// ```
/// use ticketbus_core::subject::Subject;
///
/// assert_eq!(Subject::TicketUpdated.as_str(), "ticket:updated");
/// assert_eq!("ticket:updated".parse::<Subject>().unwrap(), Subject::TicketUpdated);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subject {
    /// A ticket was listed for sale.
    #[serde(rename = "ticket:created")]
    TicketCreated,
    /// A ticket's title, price or reservation changed.
    #[serde(rename = "ticket:updated")]
    TicketUpdated,
    /// A ticket was withdrawn.
    #[serde(rename = "ticket:deleted")]
    TicketDeleted,
    /// An order reserving a ticket was placed.
    #[serde(rename = "order:created")]
    OrderCreated,
    /// An order was cancelled and its ticket released.
    #[serde(rename = "order:cancelled")]
    OrderCancelled,
    /// The reservation window of an order elapsed.
    #[serde(rename = "expiration:complete")]
    ExpirationComplete,
    /// A payment for an order was captured.
    #[serde(rename = "payment:created")]
    PaymentCreated,
    /// Deep health probe travelling through the broker.
    #[serde(rename = "stream:health-ping")]
    StreamHealthPing,
}

impl Subject {
    /// Every subject known to the registry.
    pub const ALL: [Self; 8] = [
        Self::TicketCreated,
        Self::TicketUpdated,
        Self::TicketDeleted,
        Self::OrderCreated,
        Self::OrderCancelled,
        Self::ExpirationComplete,
        Self::PaymentCreated,
        Self::StreamHealthPing,
    ];

    /// Wire name of the subject (also used as the broker topic name).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TicketCreated => "ticket:created",
            Self::TicketUpdated => "ticket:updated",
            Self::TicketDeleted => "ticket:deleted",
            Self::OrderCreated => "order:created",
            Self::OrderCancelled => "order:cancelled",
            Self::ExpirationComplete => "expiration:complete",
            Self::PaymentCreated => "payment:created",
            Self::StreamHealthPing => "stream:health-ping",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subject {
    type Err = UnknownSubject;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|subject| subject.as_str() == s)
            .ok_or_else(|| UnknownSubject(s.to_string()))
    }
}

/// Name of a queue group (one logical, horizontally scaled consumer).
///
/// All instances of one service subscribe with the same queue group so the
/// broker load-balances deliveries across them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueGroup(String);

impl QueueGroup {
    /// Orders service (keeps ticket replicas for reservations).
    pub const ORDERS_SERVICE: &'static str = "orders-service";
    /// Payments service.
    pub const PAYMENTS_SERVICE: &'static str = "payments-service";
    /// Expiration service.
    pub const EXPIRATION_SERVICE: &'static str = "expiration-service";
    /// Tickets service (listens to order lifecycle to lock tickets).
    pub const TICKETS_SERVICE: &'static str = "tickets-service";
    /// Broker deep-health probe consumers.
    pub const STREAM_HEALTH: &'static str = "stream-health";

    /// Create a queue group name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The queue group name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueGroup {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for QueueGroup {
    fn from(s: String) -> Self {
        Self(s)
    }
}
