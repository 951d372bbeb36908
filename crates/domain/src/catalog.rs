//! Catalog entities: categories and the products filed under them.

use chrono::{DateTime, Utc};
use common::EntityId;

use crate::entity::{Entity, EventQueue};
use crate::error::DomainError;
use crate::events::{
    CategoryCreated, DomainEvent, ProductCreated, ProductDeleted, ProductPriceChanged,
};

/// A product category. Names are unique across the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    id: EntityId,
    name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    events: EventQueue,
}

impl Category {
    /// Creates a category and raises `CategoryCreated`.
    pub fn create(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(DomainError::EmptyField { field: "name" });
        }

        let now = Utc::now();
        let mut category = Self {
            id: EntityId::new(),
            name,
            created_at: now,
            updated_at: now,
            events: EventQueue::new(),
        };
        category
            .events
            .raise(DomainEvent::CategoryCreated(CategoryCreated {
                category_id: category.id,
                name: category.name.clone(),
                occurred_at: now,
            }));
        Ok(category)
    }

    pub fn restore(
        id: EntityId,
        name: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            created_at,
            updated_at,
            events: EventQueue::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Entity for Category {
    const KIND: &'static str = "category";

    fn id(&self) -> EntityId {
        self.id
    }

    // Categories are never soft-deleted.
    fn is_deleted(&self) -> bool {
        false
    }

    fn events(&self) -> &EventQueue {
        &self.events
    }

    fn events_mut(&mut self) -> &mut EventQueue {
        &mut self.events
    }
}

/// A sellable product.
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    id: EntityId,
    name: String,
    description: String,
    price_cents: i64,
    category_id: EntityId,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
    events: EventQueue,
}

impl Product {
    /// Creates a product under `category` and raises `ProductCreated`.
    pub fn create(
        name: impl Into<String>,
        description: impl Into<String>,
        price_cents: i64,
        category: &Category,
    ) -> Result<Self, DomainError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(DomainError::EmptyField { field: "name" });
        }
        if price_cents < 0 {
            return Err(DomainError::NegativePrice(price_cents));
        }

        let now = Utc::now();
        let mut product = Self {
            id: EntityId::new(),
            name,
            description: description.into(),
            price_cents,
            category_id: category.id(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            events: EventQueue::new(),
        };
        product.events.raise(DomainEvent::ProductCreated(ProductCreated {
            product_id: product.id,
            category_id: product.category_id,
            name: product.name.clone(),
            price_cents,
            occurred_at: now,
        }));
        Ok(product)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: EntityId,
        name: String,
        description: String,
        price_cents: i64,
        category_id: EntityId,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            name,
            description,
            price_cents,
            category_id,
            created_at,
            updated_at,
            deleted_at,
            events: EventQueue::new(),
        }
    }

    /// Changes the price and raises `ProductPriceChanged`.
    ///
    /// Setting the current price again is a no-op and raises nothing.
    pub fn change_price(&mut self, price_cents: i64) -> Result<(), DomainError> {
        self.ensure_live()?;
        if price_cents < 0 {
            return Err(DomainError::NegativePrice(price_cents));
        }
        if price_cents == self.price_cents {
            return Ok(());
        }

        let now = Utc::now();
        let old = self.price_cents;
        self.price_cents = price_cents;
        self.updated_at = now;
        self.events
            .raise(DomainEvent::ProductPriceChanged(ProductPriceChanged {
                product_id: self.id,
                old_price_cents: old,
                new_price_cents: price_cents,
                occurred_at: now,
            }));
        Ok(())
    }

    /// Soft-deletes the product and raises `ProductDeleted`.
    pub fn delete(&mut self) -> Result<(), DomainError> {
        self.ensure_live()?;
        let now = Utc::now();
        self.deleted_at = Some(now);
        self.updated_at = now;
        self.events.raise(DomainEvent::ProductDeleted(ProductDeleted {
            product_id: self.id,
            occurred_at: now,
        }));
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), DomainError> {
        if self.deleted_at.is_some() {
            return Err(DomainError::Deleted {
                entity: Self::KIND,
                id: self.id,
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn price_cents(&self) -> i64 {
        self.price_cents
    }

    pub fn category_id(&self) -> EntityId {
        self.category_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

impl Entity for Product {
    const KIND: &'static str = "product";

    fn id(&self) -> EntityId {
        self.id
    }

    fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    fn events(&self) -> &EventQueue {
        &self.events
    }

    fn events_mut(&mut self) -> &mut EventQueue {
        &mut self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn category() -> Category {
        let mut category = Category::create("Books").unwrap();
        category.events_mut().drain();
        category
    }

    #[test]
    fn create_product_links_category() {
        let category = category();
        let product = Product::create("Dune", "sci-fi", 1299, &category).unwrap();

        assert_eq!(product.category_id(), category.id());
        assert_eq!(product.events().len(), 1);
    }

    #[test]
    fn negative_price_is_rejected() {
        let err = Product::create("Dune", "", -1, &category()).unwrap_err();
        assert_eq!(err, DomainError::NegativePrice(-1));
    }

    #[test]
    fn same_price_raises_nothing() {
        let mut product = Product::create("Dune", "", 1299, &category()).unwrap();
        product.events_mut().drain();

        product.change_price(1299).unwrap();
        assert!(product.events().is_empty());

        product.change_price(999).unwrap();
        let kinds: Vec<_> = product.events().iter().map(DomainEvent::kind).collect();
        assert_eq!(kinds, vec![EventKind::ProductPriceChanged]);
    }

    #[test]
    fn deleted_product_is_frozen() {
        let mut product = Product::create("Dune", "", 1299, &category()).unwrap();
        product.delete().unwrap();

        assert!(product.is_deleted());
        assert!(matches!(
            product.change_price(1),
            Err(DomainError::Deleted { .. })
        ));
        assert!(matches!(product.delete(), Err(DomainError::Deleted { .. })));
    }

    #[test]
    fn blank_category_name_is_rejected() {
        assert_eq!(
            Category::create(" ").unwrap_err(),
            DomainError::EmptyField { field: "name" }
        );
    }
}
