//! Domain events raised by entities.

use chrono::{DateTime, Utc};
use common::EntityId;
use serde::{Deserialize, Serialize};

/// Stable tag identifying a kind of domain event.
///
/// Event handlers are registered per kind, so dispatch never depends on
/// runtime type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    UserRegistered,
    UserDeleted,
    CategoryCreated,
    ProductCreated,
    ProductPriceChanged,
    ProductDeleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UserRegistered => "user.registered",
            EventKind::UserDeleted => "user.deleted",
            EventKind::CategoryCreated => "category.created",
            EventKind::ProductCreated => "product.created",
            EventKind::ProductPriceChanged => "product.price_changed",
            EventKind::ProductDeleted => "product.deleted",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened as a consequence of a committed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DomainEvent {
    UserRegistered(UserRegistered),
    UserDeleted(UserDeleted),
    CategoryCreated(CategoryCreated),
    ProductCreated(ProductCreated),
    ProductPriceChanged(ProductPriceChanged),
    ProductDeleted(ProductDeleted),
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::UserRegistered(_) => EventKind::UserRegistered,
            DomainEvent::UserDeleted(_) => EventKind::UserDeleted,
            DomainEvent::CategoryCreated(_) => EventKind::CategoryCreated,
            DomainEvent::ProductCreated(_) => EventKind::ProductCreated,
            DomainEvent::ProductPriceChanged(_) => EventKind::ProductPriceChanged,
            DomainEvent::ProductDeleted(_) => EventKind::ProductDeleted,
        }
    }

    /// Id of the entity that raised the event.
    pub fn entity_id(&self) -> EntityId {
        match self {
            DomainEvent::UserRegistered(e) => e.user_id,
            DomainEvent::UserDeleted(e) => e.user_id,
            DomainEvent::CategoryCreated(e) => e.category_id,
            DomainEvent::ProductCreated(e) => e.product_id,
            DomainEvent::ProductPriceChanged(e) => e.product_id,
            DomainEvent::ProductDeleted(e) => e.product_id,
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::UserRegistered(e) => e.occurred_at,
            DomainEvent::UserDeleted(e) => e.occurred_at,
            DomainEvent::CategoryCreated(e) => e.occurred_at,
            DomainEvent::ProductCreated(e) => e.occurred_at,
            DomainEvent::ProductPriceChanged(e) => e.occurred_at,
            DomainEvent::ProductDeleted(e) => e.occurred_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRegistered {
    pub user_id: EntityId,
    pub username: String,
    pub email: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDeleted {
    pub user_id: EntityId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCreated {
    pub category_id: EntityId,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub product_id: EntityId,
    pub category_id: EntityId,
    pub name: String,
    pub price_cents: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPriceChanged {
    pub product_id: EntityId,
    pub old_price_cents: i64,
    pub new_price_cents: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDeleted {
    pub product_id: EntityId,
    pub occurred_at: DateTime<Utc>,
}
