//! The tickets-service side: the authoritative ticket catalog.
//!
//! Every change is announced on the broker before it becomes visible
//! locally. If the publish fails the change is discarded and the caller sees
//! the error, so consumers never miss a version the catalog has committed.
//!
//! A publish whose outcome is unknown (the broker may have stored it) still
//! commits the change before the error is returned. The announced version is
//! then used up, so no later change is announced against it again.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use ticketbus_core::events::{TicketCreated, TicketDeleted, TicketUpdated};
use ticketbus_core::{Broker, EntityId, Version};
use ticketbus_runtime::{PublishError, Publisher};
use tokio::sync::Mutex;

/// A ticket owned by the catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ticket {
    /// Ticket identifier
    pub id: EntityId,
    /// Listing title
    pub title: String,
    /// Price in minor currency units
    pub price: u64,
    /// Seller
    pub user_id: String,
    /// Current version
    pub version: Version,
    /// Order reserving the ticket, if any
    pub order_id: Option<EntityId>,
}

/// Why a catalog operation was refused or failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// No ticket with that id.
    #[error("Ticket {0} not found")]
    NotFound(EntityId),

    /// The caller does not own the ticket.
    #[error("User {user_id} does not own ticket {id}")]
    NotOwner {
        /// Ticket
        id: EntityId,
        /// Caller
        user_id: String,
    },

    /// The title is empty.
    #[error("Title must not be empty")]
    InvalidTitle,

    /// The ticket is at the last representable version.
    #[error("Ticket {0} cannot be changed again")]
    VersionExhausted(EntityId),

    /// The change could not be announced; it was not applied.
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Ticket catalog that announces every change.
///
/// Writes are serialized: a change is published and then committed while the
/// catalog is locked, so versions are announced in order.
pub struct TicketCatalog {
    tickets: Mutex<HashMap<EntityId, Ticket>>,
    created: Publisher<TicketCreated>,
    updated: Publisher<TicketUpdated>,
    deleted: Publisher<TicketDeleted>,
}

impl TicketCatalog {
    /// Catalog publishing on `broker`.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            tickets: Mutex::new(HashMap::new()),
            created: Publisher::new(Arc::clone(&broker)),
            updated: Publisher::new(Arc::clone(&broker)),
            deleted: Publisher::new(broker),
        }
    }

    /// Catalog publishing through the given publishers.
    #[must_use]
    pub fn with_publishers(
        created: Publisher<TicketCreated>,
        updated: Publisher<TicketUpdated>,
        deleted: Publisher<TicketDeleted>,
    ) -> Self {
        Self {
            tickets: Mutex::new(HashMap::new()),
            created,
            updated,
            deleted,
        }
    }

    /// List a new ticket for `user_id`.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::InvalidTitle`] for a blank title
    /// - [`CatalogError::Publish`] if `ticket:created` was not confirmed; the
    ///   ticket is listed anyway when the outcome is unknown
    pub async fn create(
        &self,
        user_id: &str,
        title: &str,
        price: u64,
    ) -> Result<Ticket, CatalogError> {
        let title = valid_title(title)?;
        let ticket = Ticket {
            id: EntityId::generate(),
            title,
            price,
            user_id: user_id.to_string(),
            version: Version::INITIAL,
            order_id: None,
        };

        let mut tickets = self.tickets.lock().await;
        let event = TicketCreated {
            id: ticket.id.clone(),
            version: ticket.version,
            title: ticket.title.clone(),
            price: ticket.price,
            user_id: ticket.user_id.clone(),
        };
        if let Err(e) = self.created.publish(&event).await {
            if unconfirmed(&ticket.id, &e) {
                tickets.insert(ticket.id.clone(), ticket);
            }
            return Err(e.into());
        }

        tickets.insert(ticket.id.clone(), ticket.clone());
        tracing::info!(id = %ticket.id, version = %ticket.version, "Ticket listed");
        Ok(ticket)
    }

    /// Change title and price of a ticket owned by `user_id`.
    ///
    /// The announced update names the version it was made against; the
    /// ticket moves to the next version once the broker confirms.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::NotFound`] for an unknown ticket
    /// - [`CatalogError::NotOwner`] if `user_id` is not the seller
    /// - [`CatalogError::InvalidTitle`] for a blank title
    /// - [`CatalogError::VersionExhausted`] if the ticket is at `u64::MAX`
    /// - [`CatalogError::Publish`] if `ticket:updated` was not confirmed; the
    ///   change is committed anyway when the outcome is unknown
    pub async fn update(
        &self,
        id: &EntityId,
        user_id: &str,
        title: &str,
        price: u64,
    ) -> Result<Ticket, CatalogError> {
        let mut tickets = self.tickets.lock().await;
        let current = owned(&tickets, id, user_id)?;
        let title = valid_title(title)?;
        let version = current
            .version
            .next()
            .ok_or_else(|| CatalogError::VersionExhausted(id.clone()))?;

        let event = TicketUpdated {
            id: id.clone(),
            expected_version: current.version,
            title: title.clone(),
            price,
            user_id: current.user_id.clone(),
            order_id: current.order_id.clone(),
        };
        let ticket = Ticket {
            title,
            price,
            version,
            ..current
        };
        if let Err(e) = self.updated.publish(&event).await {
            if unconfirmed(id, &e) {
                tickets.insert(id.clone(), ticket);
            }
            return Err(e.into());
        }

        tickets.insert(id.clone(), ticket.clone());
        tracing::info!(id = %id, version = %ticket.version, "Ticket updated");
        Ok(ticket)
    }

    /// Withdraw a ticket owned by `user_id`.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::NotFound`] for an unknown ticket
    /// - [`CatalogError::NotOwner`] if `user_id` is not the seller
    /// - [`CatalogError::Publish`] if `ticket:deleted` was not confirmed; the
    ///   ticket is withdrawn anyway when the outcome is unknown
    pub async fn delete(&self, id: &EntityId, user_id: &str) -> Result<(), CatalogError> {
        let mut tickets = self.tickets.lock().await;
        let current = owned(&tickets, id, user_id)?;

        let event = TicketDeleted {
            id: id.clone(),
            version: current.version,
        };
        if let Err(e) = self.deleted.publish(&event).await {
            if unconfirmed(id, &e) {
                tickets.remove(id);
            }
            return Err(e.into());
        }

        tickets.remove(id);
        tracing::info!(id = %id, "Ticket withdrawn");
        Ok(())
    }

    /// Current state of a ticket.
    pub async fn get(&self, id: &EntityId) -> Option<Ticket> {
        self.tickets.lock().await.get(id).cloned()
    }

    /// Number of listed tickets.
    pub async fn len(&self) -> usize {
        self.tickets.lock().await.len()
    }

    /// Whether no tickets are listed.
    pub async fn is_empty(&self) -> bool {
        self.tickets.lock().await.is_empty()
    }
}

impl std::fmt::Debug for TicketCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketCatalog").finish_non_exhaustive()
    }
}

fn owned(
    tickets: &HashMap<EntityId, Ticket>,
    id: &EntityId,
    user_id: &str,
) -> Result<Ticket, CatalogError> {
    let ticket = tickets
        .get(id)
        .ok_or_else(|| CatalogError::NotFound(id.clone()))?;
    if ticket.user_id != user_id {
        return Err(CatalogError::NotOwner {
            id: id.clone(),
            user_id: user_id.to_string(),
        });
    }
    Ok(ticket.clone())
}

fn valid_title(title: &str) -> Result<String, CatalogError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(CatalogError::InvalidTitle);
    }
    Ok(title.to_string())
}

/// Log a failed announcement. Returns whether the change must be committed
/// because the broker may have stored it.
fn unconfirmed(id: &EntityId, error: &PublishError) -> bool {
    if error.is_indeterminate() {
        tracing::warn!(id = %id, error = %error, "Change committed; announcement outcome unknown");
        true
    } else {
        tracing::error!(id = %id, error = %error, "Change discarded; announcement failed");
        false
    }
}
