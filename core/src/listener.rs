//! The [`Listener`] trait implemented once per consumed payload type.
//!
//! A listener declares which payload it consumes (and therefore which
//! subject, through [`Event::SUBJECT`]), which queue group it joins and what
//! to do with each decoded message. Subscribing, decoding and acknowledging
//! are handled by the listener runner in `ticketbus-runtime`.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use ticketbus_core::events::StreamHealthPing;
//!
//! struct PingListener;
//!
//! #[async_trait]
//! impl Listener for PingListener {
//!     type Event = StreamHealthPing;
//!
//!     fn queue_group(&self) -> QueueGroup {
//!         QueueGroup::new(QueueGroup::STREAM_HEALTH)
//!     }
//!
//!     async fn on_message(&self, data: StreamHealthPing, msg: &MessageMetadata) -> Result<(), HandlerError> {
//!         tracing::info!(sequence = msg.sequence, message = %data.message, "ping");
//!         Ok(())
//!     }
//! }
//! ```

use crate::broker::MessageMetadata;
use crate::event::Event;
use crate::subject::{QueueGroup, Subject};
use crate::subscription::SubscriptionOptions;
use async_trait::async_trait;

/// Error returned by a listener's handler.
///
/// Any error leaves the message unacknowledged so the broker redelivers it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Typed consumer of one subject.
///
/// # Idempotency
///
/// Deliveries are at-least-once and a failed attempt may have partially
/// succeeded, so `on_message` must be safe to run again for the same message.
///
/// # Concurrency
///
/// With `max_in_flight > 1` the runner calls `on_message` concurrently.
/// Shared state touched by the handler needs its own synchronization.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Payload type consumed; fixes the subject.
    type Event: Event;

    /// Queue group this listener joins.
    fn queue_group(&self) -> QueueGroup;

    /// Subject consumed by this listener.
    fn subject(&self) -> Subject {
        <Self::Event as Event>::SUBJECT
    }

    /// Durable name the broker tracks delivery progress under.
    ///
    /// Defaults to the queue group name so all instances share progress.
    fn durable_name(&self) -> String {
        self.queue_group().as_str().to_string()
    }

    /// Subscription options used by the runner.
    ///
    /// Defaults to [`SubscriptionOptions::new`] for [`Listener::queue_group`]
    /// with [`Listener::durable_name`].
    fn subscription_options(&self) -> SubscriptionOptions {
        SubscriptionOptions::new(self.queue_group()).with_durable_name(self.durable_name())
    }

    /// Handle one decoded message.
    ///
    /// Returning `Ok(())` acknowledges the message. Returning an error leaves it
    /// unacknowledged for redelivery after the ack deadline.
    ///
    /// # Errors
    ///
    /// Any handler-specific failure. The runner logs it and does not ack.
    async fn on_message(&self, data: Self::Event, msg: &MessageMetadata) -> Result<(), HandlerError>;
}
