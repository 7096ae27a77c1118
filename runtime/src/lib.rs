//! # Ticketbus Runtime
//!
//! Runtime half of the ticketbus messaging core.
//!
//! ## Core Components
//!
//! - **[`Publisher`]**: typed, durable, fire-once publishing with a deadline
//! - **[`ListenerRunner`]**: subscribes a [`Listener`], decodes, dispatches and
//!   acknowledges, and shuts down gracefully
//! - **[`VersionGuardedStore`]**: applies replicated events to local replicas
//!   under optimistic concurrency, serialized per entity id
//! - **[`metrics`]**: Prometheus counters and histograms for all of the above
//!
//! ## Example
//!
//! ```ignore
//! use ticketbus_runtime::{ListenerRunner, Publisher, Shutdown};
//!
//! let shutdown = Shutdown::new();
//! let runner = ListenerRunner::new(listener, broker.clone(), shutdown.subscribe()).spawn();
//!
//! Publisher::<TicketCreated>::new(broker).publish(&event).await?;
//!
//! shutdown.trigger();
//! runner.await??;
//! ```
//!
//! [`Listener`]: ticketbus_core::Listener

pub mod listener;
pub mod metrics;
pub mod publisher;
pub mod shutdown;
pub mod store;

pub use listener::{ListenerError, ListenerReport, ListenerRunner};
pub use publisher::{DEFAULT_PUBLISH_TIMEOUT, PublishError, Publisher};
pub use shutdown::{Shutdown, shutdown_signal};
pub use store::{ApplyError, ApplyOutcome, VersionGuardedStore};
