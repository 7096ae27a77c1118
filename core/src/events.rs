//! Payload types for every registered subject.
//!
//! Each struct implements [`Event`] for exactly one [`Subject`]; together with
//! [`Subject::ALL`] this is the shared contract publishers and listeners of
//! all services agree on.

use crate::entity::{EntityId, Version};
use crate::event::Event;
use crate::subject::Subject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `ticket:created`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketCreated {
    /// Ticket identifier
    pub id: EntityId,
    /// Version of the new ticket (normally [`Version::INITIAL`])
    pub version: Version,
    /// Listing title
    pub title: String,
    /// Price in minor currency units
    pub price: u64,
    /// Seller
    pub user_id: String,
}

impl Event for TicketCreated {
    const SUBJECT: Subject = Subject::TicketCreated;

    fn entity_version(&self) -> Option<Version> {
        Some(self.version)
    }
}

/// `ticket:updated`
///
/// `expected_version` is the version the publisher read *before* making the
/// change. A consumer applies the update only when its replica is still at
/// that version, and then moves the replica to `expected_version.next()`.
/// An update made against `u64::MAX` can never be applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketUpdated {
    /// Ticket identifier
    pub id: EntityId,
    /// Version the change was made against
    pub expected_version: Version,
    /// New listing title
    pub title: String,
    /// New price in minor currency units
    pub price: u64,
    /// Seller
    pub user_id: String,
    /// Order currently reserving the ticket, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<EntityId>,
}

impl TicketUpdated {
    /// The version the ticket has once this update is applied, or `None`
    /// if `expected_version` has no successor.
    #[must_use]
    pub const fn resulting_version(&self) -> Option<Version> {
        self.expected_version.next()
    }
}

impl Event for TicketUpdated {
    const SUBJECT: Subject = Subject::TicketUpdated;

    fn entity_version(&self) -> Option<Version> {
        Some(self.expected_version)
    }
}

/// `ticket:deleted`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketDeleted {
    /// Ticket identifier
    pub id: EntityId,
    /// Last version the publisher saw; informational only
    pub version: Version,
}

impl Event for TicketDeleted {
    const SUBJECT: Subject = Subject::TicketDeleted;

    fn entity_version(&self) -> Option<Version> {
        Some(self.version)
    }
}

/// Lifecycle of an order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Order placed, ticket not yet reserved.
    #[serde(rename = "created")]
    Created,
    /// Order cancelled by the user or because the reservation expired.
    #[serde(rename = "cancelled")]
    Cancelled,
    /// Ticket reserved, waiting for payment.
    #[serde(rename = "awaiting:payment")]
    AwaitingPayment,
    /// Payment captured.
    #[serde(rename = "complete")]
    Complete,
}

/// The ticket an order refers to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTicket {
    /// Ticket identifier
    pub id: EntityId,
    /// Price the ticket was reserved at
    pub price: u64,
}

/// `order:created`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    /// Order identifier
    pub id: EntityId,
    /// Order version
    pub version: Version,
    /// Status at creation
    pub status: OrderStatus,
    /// Buyer
    pub user_id: String,
    /// When the reservation lapses
    pub expires_at: DateTime<Utc>,
    /// Reserved ticket
    pub ticket: OrderTicket,
}

impl Event for OrderCreated {
    const SUBJECT: Subject = Subject::OrderCreated;

    fn entity_version(&self) -> Option<Version> {
        Some(self.version)
    }
}

/// Reference to a ticket by id only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRef {
    /// Ticket identifier
    pub id: EntityId,
}

/// `order:cancelled`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    /// Order identifier
    pub id: EntityId,
    /// Order version after cancellation
    pub version: Version,
    /// Released ticket
    pub ticket: TicketRef,
}

impl Event for OrderCancelled {
    const SUBJECT: Subject = Subject::OrderCancelled;

    fn entity_version(&self) -> Option<Version> {
        Some(self.version)
    }
}

/// `expiration:complete`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpirationComplete {
    /// Order whose reservation window elapsed
    pub order_id: EntityId,
}

impl Event for ExpirationComplete {
    const SUBJECT: Subject = Subject::ExpirationComplete;
}

/// `payment:created`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCreated {
    /// Payment identifier
    pub id: EntityId,
    /// Order the payment settles
    pub order_id: EntityId,
    /// Charge reference at the payment provider
    pub charge_id: String,
}

impl Event for PaymentCreated {
    const SUBJECT: Subject = Subject::PaymentCreated;
}

/// `stream:health-ping`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHealthPing {
    /// Free-form probe text echoed into the consumer's log
    pub message: String,
}

impl Event for StreamHealthPing {
    const SUBJECT: Subject = Subject::StreamHealthPing;
}
