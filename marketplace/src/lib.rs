//! # Ticketbus Marketplace
//!
//! The ticket side of the marketplace on top of the messaging core:
//!
//! - [`catalog::TicketCatalog`]: the tickets service's authoritative catalog,
//!   which announces every change before committing it
//! - [`listeners`]: the orders service's listeners keeping
//!   [`ticket::TicketReplica`]s current through the version guard
//! - [`app::ReplicationApp`]: runs those listeners and shuts them down
//! - [`config::Config`]: environment-driven settings of the binary

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod catalog;
pub mod config;
pub mod listeners;
pub mod ticket;

pub use app::{AppError, ReplicationApp};
pub use catalog::{CatalogError, Ticket, TicketCatalog};
pub use config::{BrokerConfig, Config, ConfigError, ListenerConfig};
pub use ticket::TicketReplica;
