//! In-memory replica repository.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use ticketbus_core::{EntityId, Replica, ReplicaError, ReplicaFuture, ReplicaRepository, Version};

/// HashMap-backed [`ReplicaRepository`] for fast, deterministic tests.
///
/// Cheap to clone; clones share the same data. [`InMemoryReplicaRepository::fail`]
/// makes every operation return [`ReplicaError::Storage`].
///
/// # Example
///
/// ```ignore
/// let repository = InMemoryReplicaRepository::<TicketReplica>::new();
/// let store = VersionGuardedStore::new(Arc::new(repository.clone()));
/// // ... drive the store ...
/// assert_eq!(repository.len(), 1);
/// ```
#[derive(Debug)]
pub struct InMemoryReplicaRepository<R> {
    data: Arc<RwLock<HashMap<EntityId, R>>>,
    failing: Arc<AtomicBool>,
}

impl<R> Clone for InMemoryReplicaRepository<R> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            failing: Arc::clone(&self.failing),
        }
    }
}

impl<R: Replica> InMemoryReplicaRepository<R> {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every subsequent operation fail (or succeed again).
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Store `replica` directly, bypassing any version check.
    pub fn put(&self, replica: R) {
        self.write().insert(replica.id().clone(), replica);
    }

    /// Current replica for `id`.
    #[must_use]
    pub fn get(&self, id: &EntityId) -> Option<R> {
        self.read().get(id).cloned()
    }

    /// Number of stored replicas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the repository is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<EntityId, R>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<EntityId, R>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), ReplicaError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(ReplicaError::Storage("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl<R: Replica> Default for InMemoryReplicaRepository<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Replica> ReplicaRepository<R> for InMemoryReplicaRepository<R> {
    fn fetch<'a>(&'a self, id: &'a EntityId) -> ReplicaFuture<'a, Option<R>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.get(id))
        })
    }

    fn insert_if_absent(&self, replica: R) -> ReplicaFuture<'_, bool> {
        Box::pin(async move {
            self.check()?;
            let mut data = self.write();
            if data.contains_key(replica.id()) {
                return Ok(false);
            }
            data.insert(replica.id().clone(), replica);
            Ok(true)
        })
    }

    fn replace_if_version(&self, replica: R, expected: Version) -> ReplicaFuture<'_, bool> {
        Box::pin(async move {
            self.check()?;
            let mut data = self.write();
            match data.get_mut(replica.id()) {
                Some(current) if current.version() == expected => {
                    *current = replica;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn remove<'a>(&'a self, id: &'a EntityId) -> ReplicaFuture<'a, bool> {
        Box::pin(async move {
            self.check()?;
            Ok(self.write().remove(id).is_some())
        })
    }
}
