//! Locally held replicas of remotely owned entities.
//!
//! A service that consumes another service's events keeps a [`Replica`] of
//! each entity it cares about. Replicas are stored through a
//! [`ReplicaRepository`], the persistence collaborator, which only has to
//! offer a read and a version-conditional write. All mutation goes through the
//! version-guarded store in `ticketbus-runtime`; handlers never write
//! replicas directly.

use crate::entity::{EntityId, Version};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors reported by a replica repository.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    /// The storage backend failed.
    #[error("Replica storage error: {0}")]
    Storage(String),

    /// Stored data could not be mapped back to a replica.
    #[error("Corrupt replica {id}: {reason}")]
    Corrupt {
        /// Entity whose row is unreadable
        id: EntityId,
        /// What was wrong with it
        reason: String,
    },
}

/// Boxed future returned by repository operations.
pub type ReplicaFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ReplicaError>> + Send + 'a>>;

/// A consumer-side copy of a remotely authoritative record.
pub trait Replica: Clone + Send + Sync + 'static {
    /// Identity of the replicated entity.
    fn id(&self) -> &EntityId;

    /// Version of the state held in this replica.
    fn version(&self) -> Version;

    /// Move the replica to `version`.
    fn set_version(&mut self, version: Version);
}

/// Storage for replicas of type `R`.
///
/// The store only needs these four primitives. `replace_if_version` is the
/// conditional write that backs the optimistic concurrency check: it must
/// succeed only when the stored row is still at `expected`.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the repository can be held as
/// `Arc<dyn ReplicaRepository<R>>`.
pub trait ReplicaRepository<R: Replica>: Send + Sync {
    /// Load the replica for `id`, if present.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicaError`] if the backend fails.
    fn fetch<'a>(&'a self, id: &'a EntityId) -> ReplicaFuture<'a, Option<R>>;

    /// Store `replica` unless one already exists for its id.
    ///
    /// Resolves to `true` if inserted, `false` if a replica was already present.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicaError`] if the backend fails.
    fn insert_if_absent(&self, replica: R) -> ReplicaFuture<'_, bool>;

    /// Overwrite the stored replica if it is still at `expected`.
    ///
    /// Resolves to `true` if written, `false` if the stored version differs or
    /// the replica is gone.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicaError`] if the backend fails.
    fn replace_if_version(&self, replica: R, expected: Version) -> ReplicaFuture<'_, bool>;

    /// Remove the replica for `id`.
    ///
    /// Resolves to `true` if a replica was removed.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicaError`] if the backend fails.
    fn remove<'a>(&'a self, id: &'a EntityId) -> ReplicaFuture<'a, bool>;
}
