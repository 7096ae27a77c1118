//! Integration tests for the version-guarded entity store
//!
//! Covers the per-entity state machine (absent / present(v)), the
//! documented replication scenarios and the ordering properties under
//! arbitrary redelivery and reordering.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use proptest::prelude::*;
use std::sync::Arc;
use ticketbus_core::events::{TicketCreated, TicketUpdated};
use ticketbus_core::{EntityId, Replica, ReplicaError, ReplicaFuture, ReplicaRepository, Version};
use ticketbus_runtime::{ApplyError, ApplyOutcome, VersionGuardedStore};
use ticketbus_testing::{InMemoryReplicaRepository, fixtures, properties};

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
struct Listing {
    id: EntityId,
    title: String,
    price: u64,
    version: Version,
}

impl Replica for Listing {
    fn id(&self) -> &EntityId {
        &self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }
}

impl From<&TicketCreated> for Listing {
    fn from(event: &TicketCreated) -> Self {
        Self {
            id: event.id.clone(),
            title: event.title.clone(),
            price: event.price,
            version: event.version,
        }
    }
}

fn store() -> (VersionGuardedStore<Listing>, InMemoryReplicaRepository<Listing>) {
    let repository = InMemoryReplicaRepository::new();
    let store = VersionGuardedStore::new(Arc::new(repository.clone())).with_kind("listing");
    (store, repository)
}

async fn apply_update(
    store: &VersionGuardedStore<Listing>,
    event: &TicketUpdated,
) -> Result<ApplyOutcome, ApplyError> {
    let title = event.title.clone();
    let price = event.price;
    store
        .apply_updated(&event.id, event.expected_version, move |listing| {
            listing.title = title;
            listing.price = price;
        })
        .await
}

fn id(value: &str) -> EntityId {
    EntityId::new(value)
}

// ============================================================================
// State machine
// ============================================================================

#[tokio::test]
async fn created_moves_absent_to_present() {
    let (store, repository) = store();

    let outcome = store
        .apply_created(Listing::from(&fixtures::ticket_created("T1", "A", 10)))
        .await
        .unwrap();

    assert_eq!(outcome, ApplyOutcome::Created(Version::new(0)));
    assert_eq!(repository.get(&id("T1")).unwrap().title, "A");
}

#[tokio::test]
async fn duplicate_created_is_a_no_op() {
    let (store, repository) = store();
    store
        .apply_created(Listing::from(&fixtures::ticket_created("T1", "A", 10)))
        .await
        .unwrap();
    apply_update(&store, &fixtures::ticket_updated("T1", 0, "B", 20))
        .await
        .unwrap();

    let outcome = store
        .apply_created(Listing::from(&fixtures::ticket_created("T1", "A", 10)))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ApplyOutcome::DuplicateCreate {
            current: Version::new(1)
        }
    );
    let listing = repository.get(&id("T1")).unwrap();
    assert_eq!((listing.title.as_str(), listing.version), ("B", Version::new(1)));
}

#[tokio::test]
async fn update_to_absent_entity_is_rejected() {
    let (store, repository) = store();

    let err = apply_update(&store, &fixtures::ticket_updated("T1", 0, "B", 20))
        .await
        .unwrap_err();

    assert_eq!(err, ApplyError::Missing { id: id("T1") });
    assert!(!err.is_superseded());
    assert!(repository.is_empty());
}

#[tokio::test]
async fn delete_is_unconditional() {
    let (store, repository) = store();
    store
        .apply_created(Listing::from(&fixtures::ticket_created("T1", "A", 10)))
        .await
        .unwrap();
    apply_update(&store, &fixtures::ticket_updated("T1", 0, "B", 20))
        .await
        .unwrap();

    // Version carried by the delete does not matter.
    let outcome = store.apply_deleted(&id("T1")).await.unwrap();

    assert_eq!(outcome, ApplyOutcome::Deleted);
    assert!(repository.get(&id("T1")).is_none());
    assert_eq!(
        store.apply_deleted(&id("T1")).await.unwrap(),
        ApplyOutcome::AlreadyAbsent
    );
}

#[tokio::test]
async fn updates_after_delete_are_rejected_until_recreated() {
    let (store, _) = store();
    store
        .apply_created(Listing::from(&fixtures::ticket_created("T1", "A", 10)))
        .await
        .unwrap();
    store.apply_deleted(&id("T1")).await.unwrap();

    for expected in 0..3 {
        let err = apply_update(&store, &fixtures::ticket_updated("T1", expected, "B", 20))
            .await
            .unwrap_err();
        assert_eq!(err, ApplyError::Missing { id: id("T1") });
    }

    store
        .apply_created(Listing::from(&fixtures::ticket_created("T1", "C", 30)))
        .await
        .unwrap();
    assert_eq!(
        apply_update(&store, &fixtures::ticket_updated("T1", 0, "D", 40))
            .await
            .unwrap(),
        ApplyOutcome::Updated(Version::new(1))
    );
}

#[tokio::test]
async fn repository_failure_is_reported() {
    let (store, repository) = store();
    repository.fail(true);

    let err = store
        .apply_created(Listing::from(&fixtures::ticket_created("T1", "A", 10)))
        .await
        .unwrap_err();

    assert!(matches!(err, ApplyError::Repository(ReplicaError::Storage(_))));
}

// ============================================================================
// Documented scenarios
// ============================================================================

#[tokio::test]
async fn create_update_then_redelivered_update_is_stale() {
    let (store, repository) = store();
    let update = fixtures::ticket_updated("T1", 0, "B", 20);

    store
        .apply_created(Listing::from(&fixtures::ticket_created("T1", "A", 10)))
        .await
        .unwrap();
    assert_eq!(
        apply_update(&store, &update).await.unwrap(),
        ApplyOutcome::Updated(Version::new(1))
    );

    let err = apply_update(&store, &update).await.unwrap_err();
    assert_eq!(
        err,
        ApplyError::StaleVersion {
            id: id("T1"),
            expected: Version::new(0),
            current: Version::new(1),
        }
    );
    assert!(err.is_superseded());

    let listing = repository.get(&id("T1")).unwrap();
    assert_eq!(listing.version, Version::new(1));
    assert_eq!(listing.title, "B");
    assert_eq!(listing.price, 20);
}

#[tokio::test]
async fn update_from_the_future_is_rejected_and_reported() {
    let (store, repository) = store();
    repository.put(Listing {
        id: id("T1"),
        title: "A".to_string(),
        price: 10,
        version: Version::new(2),
    });

    let err = apply_update(&store, &fixtures::ticket_updated("T1", 5, "Z", 99))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ApplyError::StaleVersion {
            id: id("T1"),
            expected: Version::new(5),
            current: Version::new(2),
        }
    );
    assert!(!err.is_superseded());
    assert_eq!(repository.get(&id("T1")).unwrap().version, Version::new(2));
    assert_eq!(repository.get(&id("T1")).unwrap().title, "A");
}

#[tokio::test]
async fn replica_at_the_last_version_rejects_every_delivery_of_an_update() {
    let (store, repository) = store();
    repository.put(Listing {
        id: id("T1"),
        title: "A".to_string(),
        price: 10,
        version: Version::new(u64::MAX),
    });
    let update = fixtures::ticket_updated("T1", u64::MAX, "B", 20);

    for _ in 0..3 {
        let err = apply_update(&store, &update).await.unwrap_err();
        assert_eq!(
            err,
            ApplyError::VersionExhausted {
                id: id("T1"),
                current: Version::new(u64::MAX),
            }
        );
        assert!(!err.is_superseded());
    }

    let listing = repository.get(&id("T1")).unwrap();
    assert_eq!((listing.title.as_str(), listing.version), ("A", Version::new(u64::MAX)));
}

// ============================================================================
// Conditional write
// ============================================================================

/// Repository whose conditional write always loses, as if another process
/// had written the row between fetch and write.
struct RacingRepository(InMemoryReplicaRepository<Listing>);

impl ReplicaRepository<Listing> for RacingRepository {
    fn fetch<'a>(&'a self, id: &'a EntityId) -> ReplicaFuture<'a, Option<Listing>> {
        self.0.fetch(id)
    }

    fn insert_if_absent(&self, replica: Listing) -> ReplicaFuture<'_, bool> {
        self.0.insert_if_absent(replica)
    }

    fn replace_if_version(&self, _replica: Listing, _expected: Version) -> ReplicaFuture<'_, bool> {
        Box::pin(async { Ok(false) })
    }

    fn remove<'a>(&'a self, id: &'a EntityId) -> ReplicaFuture<'a, bool> {
        self.0.remove(id)
    }
}

#[tokio::test]
async fn lost_conditional_write_is_a_concurrent_write() {
    let inner = InMemoryReplicaRepository::new();
    let store = VersionGuardedStore::new(Arc::new(RacingRepository(inner.clone())));
    store
        .apply_created(Listing::from(&fixtures::ticket_created("T1", "A", 10)))
        .await
        .unwrap();

    let err = apply_update(&store, &fixtures::ticket_updated("T1", 0, "B", 20))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ApplyError::ConcurrentWrite {
            id: id("T1"),
            expected: Version::new(0),
        }
    );
    assert_eq!(inner.get(&id("T1")).unwrap().title, "A");
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_of_one_update_apply_once() {
    let (store, repository) = store();
    let store = Arc::new(store);
    store
        .apply_created(Listing::from(&fixtures::ticket_created("T1", "A", 10)))
        .await
        .unwrap();

    let update = fixtures::ticket_updated("T1", 0, "B", 20);
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let store = Arc::clone(&store);
            let update = update.clone();
            tokio::spawn(async move { apply_update(&store, &update).await })
        })
        .collect();

    let mut applied = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(ApplyOutcome::Updated(_)) => applied += 1,
            Err(e) => assert!(e.is_superseded(), "unexpected rejection: {e}"),
            Ok(other) => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(repository.get(&id("T1")).unwrap().version, Version::new(1));
    assert_eq!(store.lock_entries(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_entities_apply_independently() {
    let (store, repository) = store();
    let store = Arc::new(store);

    let tasks: Vec<_> = (0..32)
        .map(|n| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let name = format!("T{n}");
                store
                    .apply_created(Listing::from(&fixtures::ticket_created(&name, "A", 10)))
                    .await
                    .unwrap();
                apply_update(&store, &fixtures::ticket_updated(&name, 0, "B", 20))
                    .await
                    .unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(repository.len(), 32);
    assert_eq!(store.lock_entries(), 0);
}

// ============================================================================
// Properties
// ============================================================================

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().unwrap()
}

proptest! {
    /// In-order delivery loses nothing.
    #[test]
    fn in_order_updates_equal_sequential_application(chain in properties::update_chain("T1", 10)) {
        runtime().block_on(async {
            let (store, repository) = store();
            store
                .apply_created(Listing::from(&fixtures::ticket_created("T1", "A", 1)))
                .await
                .unwrap();

            for update in &chain {
                prop_assert!(apply_update(&store, update).await.is_ok());
            }

            let last = chain.last().unwrap();
            let listing = repository.get(&id("T1")).unwrap();
            prop_assert_eq!(Some(listing.version), last.resulting_version());
            prop_assert_eq!(&listing.title, &last.title);
            prop_assert_eq!(listing.price, last.price);
            Ok(())
        })?;
    }

    /// A newer update followed by an older one leaves the newer state.
    #[test]
    fn older_update_after_newer_is_rejected(
        older_title in properties::title(),
        newer_title in properties::title(),
    ) {
        runtime().block_on(async {
            let (store, repository) = store();
            store
                .apply_created(Listing::from(&fixtures::ticket_created("T1", "A", 1)))
                .await
                .unwrap();
            apply_update(&store, &fixtures::ticket_updated("T1", 0, "first", 1)).await.unwrap();

            let older = fixtures::ticket_updated("T1", 0, &older_title, 2);
            let newer = fixtures::ticket_updated("T1", 1, &newer_title, 3);
            prop_assert!(apply_update(&store, &newer).await.is_ok());
            let err = apply_update(&store, &older).await.unwrap_err();
            prop_assert!(err.is_superseded());

            let listing = repository.get(&id("T1")).unwrap();
            prop_assert_eq!(listing.version, Version::new(2));
            prop_assert_eq!(&listing.title, &newer_title);
            Ok(())
        })?;
    }

    /// Under arbitrary reordering and duplication, with redelivery of
    /// every rejected update, the store converges to the in-order result.
    #[test]
    fn redelivery_converges_to_in_order_state(
        (chain, delivery) in properties::chain_and_delivery("T1", 6),
    ) {
        runtime().block_on(async {
            let (store, repository) = store();
            store
                .apply_created(Listing::from(&fixtures::ticket_created("T1", "A", 1)))
                .await
                .unwrap();

            let mut queue: std::collections::VecDeque<TicketUpdated> = delivery.into();
            let mut applied = 0;
            let mut budget = 1_000;
            while let Some(update) = queue.pop_front() {
                budget -= 1;
                prop_assert!(budget > 0, "redelivery did not converge");
                match apply_update(&store, &update).await {
                    Ok(_) => applied += 1,
                    Err(e) if e.is_superseded() => {}
                    Err(_) => queue.push_back(update),
                }
            }

            let last = chain.last().unwrap();
            let listing = repository.get(&id("T1")).unwrap();
            prop_assert_eq!(applied, chain.len());
            prop_assert_eq!(Some(listing.version), last.resulting_version());
            prop_assert_eq!(&listing.title, &last.title);
            Ok(())
        })?;
    }

    /// Applying the same update twice changes nothing the second time.
    #[test]
    fn duplicate_update_is_idempotent(title in properties::title(), price in properties::price()) {
        runtime().block_on(async {
            let (store, repository) = store();
            store
                .apply_created(Listing::from(&fixtures::ticket_created("T1", "A", 1)))
                .await
                .unwrap();
            let update = fixtures::ticket_updated("T1", 0, &title, price);

            apply_update(&store, &update).await.unwrap();
            let once = repository.get(&id("T1")).unwrap();
            prop_assert!(apply_update(&store, &update).await.is_err());
            prop_assert_eq!(repository.get(&id("T1")).unwrap(), once);
            Ok(())
        })?;
    }
}
