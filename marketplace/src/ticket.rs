//! Ticket as seen by the orders side: a replica of the tickets service's data.

use serde::{Deserialize, Serialize};
use ticketbus_core::events::TicketCreated;
use ticketbus_core::{EntityId, Replica, Version};

/// Local copy of a ticket, kept current by the ticket listeners.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketReplica {
    /// Ticket identifier, shared with the tickets service
    pub id: EntityId,
    /// Listing title
    pub title: String,
    /// Price in minor currency units
    pub price: u64,
    /// Version of the last applied change
    pub version: Version,
}

impl Replica for TicketReplica {
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

impl From<&TicketCreated> for TicketReplica {
    fn from(event: &TicketCreated) -> Self {
        Self {
            id: event.id.clone(),
            title: event.title.clone(),
            price: event.price,
            version: event.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ticketbus_testing::fixtures;

    #[test]
    fn replica_starts_at_the_announced_version() {
        let replica = TicketReplica::from(&fixtures::ticket_created("T1", "Concert", 20));

        assert_eq!(replica.id, EntityId::new("T1"));
        assert_eq!(replica.title, "Concert");
        assert_eq!(replica.price, 20);
        assert_eq!(replica.version(), Version::INITIAL);
    }
}
