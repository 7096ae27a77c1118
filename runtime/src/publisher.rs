//! Typed, durable, fire-once publishing.
//!
//! A [`Publisher<E>`] can only publish payloads of type `E`, and therefore only
//! on `E::SUBJECT`. `publish` resolves once the broker has durably stored the
//! message, or with a [`PublishError`] the caller must handle. There is no
//! retry here: only the caller knows whether its own state change has already
//! been committed and needs undoing.

use crate::metrics::PublisherMetrics;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use ticketbus_core::{Broker, BrokerError, Event, EventError, PublishAck, Subject};

/// Default time to wait for the broker to confirm a publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a publish did not reach durable storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The payload could not be encoded.
    #[error(transparent)]
    Serialization(#[from] EventError),

    /// The broker rejected the message or could not be reached.
    #[error("Broker error on '{subject}': {source}")]
    Broker {
        /// Subject being published on
        subject: Subject,
        /// Underlying broker failure
        #[source]
        source: BrokerError,
    },

    /// The broker did not confirm within the publish deadline.
    #[error("Publish on '{subject}' not confirmed within {after:?}")]
    Timeout {
        /// Subject being published on
        subject: Subject,
        /// Deadline that elapsed
        after: Duration,
    },
}

impl PublishError {
    /// Whether the broker may have stored the message anyway.
    ///
    /// After a timeout the outcome is unknown; a caller that rolls back its
    /// local change may still see the event delivered.
    #[must_use]
    pub const fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Broker {
                    source: BrokerError::Timeout { .. },
                    ..
                }
        )
    }
}

/// Publishes events of one payload type.
///
/// Cheap to clone; clones share the broker connection.
///
/// # Example
///
/// ```rust,ignore
/// let publisher = Publisher::<TicketCreated>::new(broker.clone());
/// let ack = publisher.publish(&event).await?;
/// tracing::info!(sequence = ack.sequence, "ticket announced");
/// ```
pub struct Publisher<E: Event> {
    broker: Arc<dyn Broker>,
    timeout: Duration,
    _event: PhantomData<fn(E)>,
}

impl<E: Event> Clone for Publisher<E> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            timeout: self.timeout,
            _event: PhantomData,
        }
    }
}

impl<E: Event> std::fmt::Debug for Publisher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("subject", &E::SUBJECT)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<E: Event> Publisher<E> {
    /// Create a publisher with the default deadline.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            timeout: DEFAULT_PUBLISH_TIMEOUT,
            _event: PhantomData,
        }
    }

    /// Override the publish deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Subject this publisher writes to.
    #[must_use]
    pub const fn subject(&self) -> Subject {
        E::SUBJECT
    }

    /// Encode `event` and wait for the broker to store it.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Serialization`] if the payload cannot be encoded
    /// - [`PublishError::Broker`] if the broker is unreachable or refuses it
    /// - [`PublishError::Timeout`] if no confirmation arrives in time
    pub async fn publish(&self, event: &E) -> Result<PublishAck, PublishError> {
        let subject = E::SUBJECT;
        let payload = event.encode().inspect_err(|e| {
            tracing::error!(subject = %subject, error = %e, "Failed to encode event");
            PublisherMetrics::record_error(subject);
        })?;

        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.broker.publish(subject, payload)).await;

        match result {
            Ok(Ok(ack)) => {
                PublisherMetrics::record_published(subject, start.elapsed());
                tracing::info!(
                    subject = %subject,
                    sequence = ack.sequence,
                    version = ?event.entity_version(),
                    "Event published"
                );
                Ok(ack)
            }
            Ok(Err(source)) => {
                PublisherMetrics::record_error(subject);
                tracing::error!(subject = %subject, error = %source, "Failed to publish event");
                Err(PublishError::Broker { subject, source })
            }
            Err(_) => {
                PublisherMetrics::record_error(subject);
                tracing::error!(
                    subject = %subject,
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "Publish not confirmed in time"
                );
                Err(PublishError::Timeout {
                    subject,
                    after: self.timeout,
                })
            }
        }
    }
}
