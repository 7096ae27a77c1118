//! `PostgreSQL` replica storage for the ticketbus messaging core.
//!
//! This crate provides [`PostgresReplicaRepository`], a
//! [`ReplicaRepository`](ticketbus_core::ReplicaRepository) backed by sqlx:
//!
//! - `insert_if_absent` is `INSERT ... ON CONFLICT DO NOTHING`
//! - `replace_if_version` is `UPDATE ... WHERE version = $expected`
//! - `remove` is an unconditional `DELETE`
//!
//! Combined with the runtime's version-guarded store, concurrent consumers in
//! different processes can never both apply the same update.
//!
//! # Example
//!
//! ```ignore
//! use ticketbus_postgres::PostgresReplicaRepository;
//! use ticketbus_runtime::VersionGuardedStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let tickets = PostgresReplicaRepository::<TicketReplica>::connect(
//!         "postgres://localhost/orders",
//!         "ticket",
//!     )
//!     .await?;
//!     tickets.migrate().await?;
//!     let store = VersionGuardedStore::new(Arc::new(tickets));
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod replica_repository;

pub use replica_repository::{CREATE_REPLICAS_TABLE, PostgresReplicaRepository};
