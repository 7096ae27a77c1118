//! # Ticketbus Core
//!
//! Shared contract and seams of the ticket marketplace's messaging core.
//!
//! Services in the marketplace own their data and tell each other about
//! changes by publishing events on a durable streaming broker. This crate
//! holds what every service must agree on:
//!
//! - **Registry**: the closed set of [`Subject`]s and the payload type bound
//!   to each ([`events`]), with their JSON wire encoding ([`Event`]).
//! - **Broker seam**: the [`Broker`] trait with durable publish, queue-group
//!   subscriptions and manual acknowledgment.
//! - **Listener contract**: the [`Listener`] trait a consumer implements per
//!   subject.
//! - **Replicas**: [`Replica`] and [`ReplicaRepository`], the local copies a
//!   consumer keeps of another service's entities.
//!
//! Runtime behavior (publishing with a deadline, running listeners, the
//! version-guarded store) lives in `ticketbus-runtime`.
//!
//! ## Example
//!
//! ```
//! use ticketbus_core::events::TicketCreated;
//! use ticketbus_core::{EntityId, Event, Subject, Version};
//!
//! let event = TicketCreated {
//!     id: EntityId::new("T1"),
//!     version: Version::INITIAL,
//!     title: "Concert".to_string(),
//!     price: 20,
//!     user_id: "u-1".to_string(),
//! };
//! assert_eq!(TicketCreated::SUBJECT, Subject::TicketCreated);
//! let bytes = event.encode().unwrap();
//! assert_eq!(TicketCreated::decode(&bytes).unwrap(), event);
//! ```

pub mod broker;
pub mod entity;
pub mod event;
pub mod events;
pub mod listener;
pub mod replica;
pub mod subject;
pub mod subscription;

pub use broker::{
    AckHandle, Acknowledger, Broker, BrokerError, BrokerFuture, Delivery, DeliveryStream,
    MessageMetadata, PublishAck, Subscription, SubscriptionControl,
};
pub use entity::{EntityId, ParseEntityIdError, Version};
pub use event::{Event, EventError};
pub use listener::{HandlerError, Listener};
pub use replica::{Replica, ReplicaError, ReplicaFuture, ReplicaRepository};
pub use subject::{QueueGroup, Subject, UnknownSubject};
pub use subscription::{
    ConsumerGroupIdentity, DEFAULT_ACK_WAIT, DEFAULT_MAX_IN_FLIGHT, InvalidIdentity,
    SubscriptionOptions,
};

// Re-export commonly used types
pub use async_trait::async_trait;
pub use chrono::{DateTime, Utc};
