//! The version-guarded entity store.
//!
//! Applies replicated `created`, `updated` and `deleted` events to local
//! replicas so that duplicate and out-of-order deliveries never corrupt them.
//!
//! # State machine (per entity id)
//!
//! ```text
//!            created(v)                  updated(expected == v)
//!  absent ─────────────▶ present(v) ─────────────────────────▶ present(v + 1)
//!    ▲                      │
//!    └────── deleted ───────┘
//! ```
//!
//! - `created` on a present entity is a no-op ([`ApplyOutcome::DuplicateCreate`]).
//! - `updated` with `expected != v` is rejected ([`ApplyError::StaleVersion`]).
//! - `updated` on an absent entity is rejected ([`ApplyError::Missing`]).
//! - `updated` against `u64::MAX` is rejected ([`ApplyError::VersionExhausted`]).
//! - `deleted` is unconditional.
//!
//! All transitions for one id are serialized through a per-id async lock;
//! different ids proceed in parallel. The repository's conditional write is a
//! second line of defence for stores shared between processes.

use crate::metrics::ReplicaMetrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use ticketbus_core::{EntityId, Replica, ReplicaError, ReplicaRepository, Version};
use tokio::sync::OwnedMutexGuard;

/// Result of a transition that was accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new replica was stored at the given version.
    Created(Version),
    /// The replica was already present; nothing changed.
    DuplicateCreate {
        /// Version of the replica already held
        current: Version,
    },
    /// The update was applied and the replica moved to the given version.
    Updated(Version),
    /// The replica was removed.
    Deleted,
    /// There was nothing to delete.
    AlreadyAbsent,
}

/// Why a transition was not applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The update was made against a different version than the one held.
    #[error("Stale update for {id}: expected version {expected}, current {current}")]
    StaleVersion {
        /// Entity the update targets
        id: EntityId,
        /// Version the update was made against
        expected: Version,
        /// Version held locally
        current: Version,
    },

    /// The update targets an entity that has not been created locally.
    #[error("Update for {id} arrived before the entity was created")]
    Missing {
        /// Entity the update targets
        id: EntityId,
    },

    /// The replica is at the last representable version.
    #[error("Replica {id} is at version {current} and cannot be updated again")]
    VersionExhausted {
        /// Entity the update targets
        id: EntityId,
        /// Version held locally
        current: Version,
    },

    /// The repository's conditional write lost against another writer.
    #[error("Concurrent write to {id} at version {expected}")]
    ConcurrentWrite {
        /// Entity being written
        id: EntityId,
        /// Version the write was conditioned on
        expected: Version,
    },

    /// The repository failed.
    #[error(transparent)]
    Repository(#[from] ReplicaError),
}

impl ApplyError {
    /// Whether the rejected update is already reflected in the replica.
    ///
    /// True for a [`ApplyError::StaleVersion`] whose expected version is
    /// behind the current one: a redelivery or a late duplicate. An update
    /// from the future (`expected > current`), a missing entity or a failed
    /// write is not superseded and may succeed on redelivery.
    #[must_use]
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::StaleVersion { expected, current, .. } if expected < current)
    }
}

type LockTable = HashMap<EntityId, Arc<tokio::sync::Mutex<()>>>;

/// Per-id lock table.
///
/// An entry is dropped when its last holder releases it and nobody waits.
#[derive(Default)]
struct IdLocks {
    locks: Mutex<LockTable>,
}

impl IdLocks {
    fn table(&self) -> std::sync::MutexGuard<'_, LockTable> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn lock(&self, id: &EntityId) -> IdGuard<'_> {
        let lock = Arc::clone(self.table().entry(id.clone()).or_default());
        IdGuard {
            locks: self,
            id: id.clone(),
            held: Some(lock.lock_owned().await),
        }
    }

    fn len(&self) -> usize {
        self.table().len()
    }
}

/// Holds the lock of one id; prunes its table entry on release.
struct IdGuard<'a> {
    locks: &'a IdLocks,
    id: EntityId,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut table = self.locks.table();
        // Waiters hold their own clone, so a count of one means idle.
        if table.get(&self.id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            table.remove(&self.id);
        }
    }
}

/// Applies replicated events to replicas of type `R` under the version guard.
///
/// The store is the only writer of replicas; listeners call it instead of
/// touching the repository.
///
/// # Example
///
/// ```rust,ignore
/// let store = VersionGuardedStore::new(Arc::new(InMemoryReplicaRepository::new()));
/// store.apply_created(ticket).await?;
/// store
///     .apply_updated(&id, Version::new(0), |t| t.title = "B".into())
///     .await?;
/// ```
pub struct VersionGuardedStore<R: Replica> {
    repository: Arc<dyn ReplicaRepository<R>>,
    locks: IdLocks,
    kind: &'static str,
}

impl<R: Replica> VersionGuardedStore<R> {
    /// Create a store over `repository`.
    #[must_use]
    pub fn new(repository: Arc<dyn ReplicaRepository<R>>) -> Self {
        Self {
            repository,
            locks: IdLocks::default(),
            kind: "replica",
        }
    }

    /// Label used in logs and metrics (for example `"ticket"`).
    #[must_use]
    pub const fn with_kind(mut self, kind: &'static str) -> Self {
        self.kind = kind;
        self
    }

    /// Read the replica for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Repository`] if the repository fails.
    pub async fn get(&self, id: &EntityId) -> Result<Option<R>, ApplyError> {
        Ok(self.repository.fetch(id).await?)
    }

    /// Apply a `created` event: `absent -> present(v)`.
    ///
    /// A replica that already exists is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Repository`] if the repository fails.
    pub async fn apply_created(&self, replica: R) -> Result<ApplyOutcome, ApplyError> {
        let id = replica.id().clone();
        let version = replica.version();
        let _guard = self.locks.lock(&id).await;

        if self.repository.insert_if_absent(replica).await? {
            ReplicaMetrics::record_applied(self.kind, "created");
            tracing::info!(kind = self.kind, id = %id, version = %version, "Replica created");
            return Ok(ApplyOutcome::Created(version));
        }

        let current = self
            .repository
            .fetch(&id)
            .await?
            .map_or(version, |existing| existing.version());
        ReplicaMetrics::record_ignored(self.kind, "duplicate_create");
        tracing::debug!(
            kind = self.kind,
            id = %id,
            version = %version,
            current = %current,
            "Duplicate create ignored"
        );
        Ok(ApplyOutcome::DuplicateCreate { current })
    }

    /// Apply an `updated` event made against `expected`.
    ///
    /// `patch` replaces the business fields; the store sets the version to
    /// `expected + 1`.
    ///
    /// # Errors
    ///
    /// - [`ApplyError::Missing`] if no replica exists
    /// - [`ApplyError::StaleVersion`] if the replica is not at `expected`
    /// - [`ApplyError::VersionExhausted`] if `expected` is `u64::MAX`
    /// - [`ApplyError::ConcurrentWrite`] if another writer changed the row
    /// - [`ApplyError::Repository`] if the repository fails
    pub async fn apply_updated<F>(
        &self,
        id: &EntityId,
        expected: Version,
        patch: F,
    ) -> Result<ApplyOutcome, ApplyError>
    where
        F: FnOnce(&mut R) + Send,
    {
        let _guard = self.locks.lock(id).await;

        let Some(mut replica) = self.repository.fetch(id).await? else {
            ReplicaMetrics::record_rejected(self.kind, "missing");
            tracing::warn!(
                kind = self.kind,
                id = %id,
                expected = %expected,
                "Update for unknown replica rejected"
            );
            return Err(ApplyError::Missing { id: id.clone() });
        };

        let current = replica.version();
        if current != expected {
            ReplicaMetrics::record_rejected(self.kind, "stale_version");
            tracing::info!(
                kind = self.kind,
                id = %id,
                expected = %expected,
                current = %current,
                "Out-of-order update rejected"
            );
            return Err(ApplyError::StaleVersion {
                id: id.clone(),
                expected,
                current,
            });
        }

        let Some(next) = expected.next() else {
            ReplicaMetrics::record_rejected(self.kind, "version_exhausted");
            tracing::error!(
                kind = self.kind,
                id = %id,
                current = %current,
                "Update rejected; replica is at the last version"
            );
            return Err(ApplyError::VersionExhausted {
                id: id.clone(),
                current,
            });
        };
        patch(&mut replica);
        replica.set_version(next);

        if !self.repository.replace_if_version(replica, expected).await? {
            ReplicaMetrics::record_rejected(self.kind, "concurrent_write");
            tracing::warn!(
                kind = self.kind,
                id = %id,
                expected = %expected,
                "Conditional write lost"
            );
            return Err(ApplyError::ConcurrentWrite {
                id: id.clone(),
                expected,
            });
        }

        ReplicaMetrics::record_applied(self.kind, "updated");
        tracing::info!(kind = self.kind, id = %id, version = %next, "Replica updated");
        Ok(ApplyOutcome::Updated(next))
    }

    /// Apply a `deleted` event: `present(any) -> absent`.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Repository`] if the repository fails.
    pub async fn apply_deleted(&self, id: &EntityId) -> Result<ApplyOutcome, ApplyError> {
        let _guard = self.locks.lock(id).await;

        if self.repository.remove(id).await? {
            ReplicaMetrics::record_applied(self.kind, "deleted");
            tracing::info!(kind = self.kind, id = %id, "Replica deleted");
            Ok(ApplyOutcome::Deleted)
        } else {
            ReplicaMetrics::record_ignored(self.kind, "already_absent");
            tracing::debug!(kind = self.kind, id = %id, "Delete for absent replica ignored");
            Ok(ApplyOutcome::AlreadyAbsent)
        }
    }

    /// Number of ids currently holding a lock entry.
    #[doc(hidden)]
    #[must_use]
    pub fn lock_entries(&self) -> usize {
        self.locks.len()
    }
}

impl<R: Replica> std::fmt::Debug for VersionGuardedStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionGuardedStore")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
