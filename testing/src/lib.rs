//! # Ticketbus Testing
//!
//! Testing utilities for the ticketbus messaging core.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: a broker with durable logs, queue groups, manual
//!   acknowledgment and ack-wait redelivery, driven by tokio time
//! - [`InMemoryReplicaRepository`]: a replica repository with failure
//!   injection
//! - [`fixtures`]: ticket event builders
//! - [`properties`]: proptest strategies for version-guard properties
//!
//! ## Example
//!
//! ```ignore
//! use ticketbus_testing::{InMemoryBroker, fixtures};
//!
//! #[tokio::test(start_paused = true)]
//! async fn replicates_ticket() {
//!     let broker = Arc::new(InMemoryBroker::new());
//!     Publisher::new(broker.clone())
//!         .publish(&fixtures::ticket_created("T1", "A", 10))
//!         .await
//!         .unwrap();
//!     // ... run listeners against `broker` ...
//! }
//! ```

pub mod in_memory_broker;
pub mod replica_mocks;

pub use in_memory_broker::InMemoryBroker;
pub use replica_mocks::InMemoryReplicaRepository;

/// Builders for ticket events.
pub mod fixtures {
    use ticketbus_core::EntityId;
    use ticketbus_core::Version;
    use ticketbus_core::events::{StreamHealthPing, TicketCreated, TicketDeleted, TicketUpdated};

    /// Seller used by every fixture.
    pub const SELLER: &str = "user-1";

    /// `ticket:created` at version 0.
    #[must_use]
    pub fn ticket_created(id: &str, title: &str, price: u64) -> TicketCreated {
        TicketCreated {
            id: EntityId::new(id),
            version: Version::INITIAL,
            title: title.to_string(),
            price,
            user_id: SELLER.to_string(),
        }
    }

    /// `ticket:updated` made against `expected_version`.
    #[must_use]
    pub fn ticket_updated(id: &str, expected_version: u64, title: &str, price: u64) -> TicketUpdated {
        TicketUpdated {
            id: EntityId::new(id),
            expected_version: Version::new(expected_version),
            title: title.to_string(),
            price,
            user_id: SELLER.to_string(),
            order_id: None,
        }
    }

    /// `ticket:deleted` seen at `version`.
    #[must_use]
    pub fn ticket_deleted(id: &str, version: u64) -> TicketDeleted {
        TicketDeleted {
            id: EntityId::new(id),
            version: Version::new(version),
        }
    }

    /// `stream:health-ping`.
    #[must_use]
    pub fn health_ping(message: &str) -> StreamHealthPing {
        StreamHealthPing {
            message: message.to_string(),
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use crate::fixtures;
    use proptest::prelude::*;
    use ticketbus_core::events::TicketUpdated;

    /// Listing titles.
    pub fn title() -> impl Strategy<Value = String> {
        "[A-Za-z][A-Za-z0-9 ]{0,15}"
    }

    /// Prices in minor units.
    pub fn price() -> impl Strategy<Value = u64> {
        0u64..1_000_000
    }

    /// A gapless chain of updates for `id`, starting from version 0.
    ///
    /// The `n`-th update is made against version `n`.
    pub fn update_chain(id: &'static str, max_len: usize) -> impl Strategy<Value = Vec<TicketUpdated>> {
        prop::collection::vec((title(), price()), 1..=max_len).prop_map(move |fields| {
            fields
                .into_iter()
                .zip(0u64..)
                .map(|((title, price), version)| fixtures::ticket_updated(id, version, &title, price))
                .collect::<Vec<_>>()
        })
    }

    /// A chain of updates and a delivery order that is a permutation of it,
    /// possibly with duplicates.
    pub fn chain_and_delivery(
        id: &'static str,
        max_len: usize,
    ) -> impl Strategy<Value = (Vec<TicketUpdated>, Vec<TicketUpdated>)> {
        update_chain(id, max_len).prop_flat_map(|chain| {
            let len = chain.len();
            let indices = prop::collection::vec(0..len, 0..=len).prop_map(move |extra| {
                let mut all: Vec<usize> = (0..len).collect();
                all.extend(extra);
                all
            });
            (Just(chain), indices.prop_shuffle())
        })
        .prop_map(|(chain, order)| {
            let delivery: Vec<TicketUpdated> = order.iter().map(|&i| chain[i].clone()).collect();
            (chain, delivery)
        })
    }
}

/// Install a test-friendly tracing subscriber once.
///
/// Honors `RUST_LOG`; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn update_chain_is_gapless(chain in properties::update_chain("T1", 8)) {
            for (n, update) in chain.iter().enumerate() {
                prop_assert_eq!(update.expected_version.value(), n as u64);
            }
        }

        #[test]
        fn delivery_covers_whole_chain((chain, delivery) in properties::chain_and_delivery("T1", 6)) {
            prop_assert!(delivery.len() >= chain.len());
            for update in &chain {
                prop_assert!(delivery.contains(update));
            }
        }
    }
}
