//! Broker abstraction for durable, replayable subject streams.
//!
//! The [`Broker`] trait is the seam between the messaging core and a concrete
//! streaming broker. It models exactly what the core relies on:
//!
//! - `publish` resolves only once the broker has durably stored the message
//!   and assigned it a sequence number.
//! - `subscribe` joins a durable subscription inside a queue group. Each
//!   stored message is handed to one member of the group at a time.
//! - Every [`Delivery`] carries an [`AckHandle`]. Acknowledging consumes the
//!   handle. A delivery that is never acknowledged is redelivered once the
//!   subscription's ack deadline passes, possibly to another member.
//!
//! ```text
//!  publisher ──publish──▶ ┌─────────────┐ ──delivery──▶ listener (instance A)
//!                         │   broker    │
//!                         │ durable log │ ──delivery──▶ listener (instance B)
//!                         └─────────────┘      ▲
//!                                ▲             │
//!                                └──── ack ────┘
//! ```
//!
//! # Implementations
//!
//! - `InMemoryBroker` (in `ticketbus-testing`) - deterministic tests
//! - `RedpandaBroker` (in `ticketbus-redpanda`) - Kafka-compatible clusters
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
//! broker can be shared as `Arc<dyn Broker>` between publishers and listeners.

use crate::subject::Subject;
use crate::subscription::SubscriptionOptions;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;

/// Boxed future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker cannot be reached.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker refused or failed to store a message.
    #[error("Publish failed for subject '{subject}': {reason}")]
    PublishFailed {
        /// Subject the message was published on
        subject: Subject,
        /// Broker-provided reason
        reason: String,
    },

    /// The broker did not confirm in time.
    #[error("Timed out after {after_ms}ms while {operation}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Elapsed deadline in milliseconds
        after_ms: u64,
    },

    /// A subscription could not be established.
    #[error("Subscription failed for subject '{subject}': {reason}")]
    SubscriptionFailed {
        /// Subject being subscribed to
        subject: Subject,
        /// Broker-provided reason
        reason: String,
    },

    /// An acknowledgment could not be delivered to the broker.
    #[error("Acknowledgment failed for sequence {sequence}: {reason}")]
    AckFailed {
        /// Sequence of the message being acknowledged
        sequence: u64,
        /// Broker-provided reason
        reason: String,
    },

    /// The connection or subscription has been closed.
    #[error("Broker connection closed")]
    Closed,
}

/// Broker confirmation that a message is durably stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishAck {
    /// Subject the message was stored under
    pub subject: Subject,
    /// Broker-assigned sequence number, increasing per subject
    pub sequence: u64,
}

/// Broker metadata of one delivered message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Subject the message was published on
    pub subject: Subject,
    /// Broker-assigned sequence number
    pub sequence: u64,
    /// Whether this message was handed out before without acknowledgment
    pub redelivered: bool,
    /// 1 for the first delivery, incremented on each redelivery
    pub delivery_attempt: u32,
    /// When the broker stored the message
    pub published_at: DateTime<Utc>,
}

/// Broker-side acknowledgment of one delivery.
///
/// Implemented by each broker. Taking `Box<Self>` makes an acknowledgment
/// single-use.
pub trait Acknowledger: Send + Sync {
    /// Acknowledge the delivery this acknowledger was issued for.
    fn ack(self: Box<Self>) -> BrokerFuture<'static, ()>;
}

/// Single-use acknowledgment capability bound to one delivery.
///
/// Dropping the handle without calling [`AckHandle::ack`] leaves the message
/// unacknowledged; the broker redelivers it after the ack deadline.
pub struct AckHandle {
    sequence: u64,
    inner: Box<dyn Acknowledger>,
}

impl AckHandle {
    /// Wrap a broker-specific acknowledger.
    #[must_use]
    pub fn new(sequence: u64, inner: Box<dyn Acknowledger>) -> Self {
        Self { sequence, inner }
    }

    /// Sequence of the delivery this handle acknowledges.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AckFailed`] or [`BrokerError::Closed`] if the
    /// broker could not record the acknowledgment. The message will then be
    /// redelivered, so handlers must tolerate repeats.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.inner.ack().await
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// One message handed to a subscriber.
#[derive(Debug)]
pub struct Delivery {
    metadata: MessageMetadata,
    data: Vec<u8>,
    ack: AckHandle,
}

impl Delivery {
    /// Assemble a delivery.
    #[must_use]
    pub const fn new(metadata: MessageMetadata, data: Vec<u8>, ack: AckHandle) -> Self {
        Self {
            metadata,
            data,
            ack,
        }
    }

    /// Broker metadata.
    #[must_use]
    pub const fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    /// Raw payload bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Split into metadata, payload and acknowledgment handle.
    #[must_use]
    pub fn into_parts(self) -> (MessageMetadata, Vec<u8>, AckHandle) {
        (self.metadata, self.data, self.ack)
    }
}

/// Stream of deliveries for one subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Broker-specific teardown of a subscription.
pub trait SubscriptionControl: Send + Sync {
    /// Detach from the broker cleanly.
    ///
    /// Unacknowledged deliveries become available to the other members of
    /// the queue group.
    fn close(self: Box<Self>) -> BrokerFuture<'static, ()>;
}

/// A live durable subscription.
///
/// Yields deliveries as a [`Stream`]. Call [`Subscription::close`] on shutdown
/// so the broker sees a clean departure instead of a crashed consumer.
pub struct Subscription {
    subject: Subject,
    options: SubscriptionOptions,
    deliveries: DeliveryStream,
    control: Box<dyn SubscriptionControl>,
}

impl Subscription {
    /// Assemble a subscription from its delivery stream and teardown control.
    #[must_use]
    pub fn new(
        subject: Subject,
        options: SubscriptionOptions,
        deliveries: DeliveryStream,
        control: Box<dyn SubscriptionControl>,
    ) -> Self {
        Self {
            subject,
            options,
            deliveries,
            control,
        }
    }

    /// Subject this subscription is bound to.
    #[must_use]
    pub const fn subject(&self) -> Subject {
        self.subject
    }

    /// Options the subscription was created with.
    #[must_use]
    pub const fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    /// Close the subscription.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the broker could not be told about the
    /// departure; the broker then falls back to its own liveness timeout.
    pub async fn close(self) -> Result<(), BrokerError> {
        self.control.close().await
    }
}

impl Stream for Subscription {
    type Item = Result<Delivery, BrokerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.deliveries.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A durable streaming broker.
///
/// # Delivery guarantees
///
/// - **At-least-once**: a message may be delivered more than once.
/// - **No end-to-end ordering**: redeliveries and multiple publishers can
///   reorder messages. Consumers protect their state with version checks.
/// - **Manual acknowledgment**: a message counts as processed only once its
///   [`AckHandle`] has been used.
///
/// # Thread Safety
///
/// Implementations are `Send + Sync` and shared as `Arc<dyn Broker>`.
pub trait Broker: Send + Sync {
    /// Durably store `payload` under `subject`.
    ///
    /// Resolves once the broker confirms storage. No retries are made here;
    /// the caller decides whether to retry or to undo its own state change.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::ConnectionFailed`] if the broker is unreachable
    /// - [`BrokerError::Timeout`] if the broker did not confirm in time
    /// - [`BrokerError::PublishFailed`] for any other broker refusal
    fn publish(&self, subject: Subject, payload: Vec<u8>) -> BrokerFuture<'_, PublishAck>;

    /// Join (or resume) a durable subscription to `subject`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] or
    /// [`BrokerError::ConnectionFailed`] if the subscription cannot be set up.
    fn subscribe(
        &self,
        subject: Subject,
        options: SubscriptionOptions,
    ) -> BrokerFuture<'_, Subscription>;
}
