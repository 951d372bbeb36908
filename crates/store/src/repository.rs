//! Repository traits, one per kind of record.
//!
//! A repository never begins or commits anything. It runs each statement on
//! the transaction bound to its [`Session`](crate::Session), or on the base
//! connection when nothing is bound.

use async_trait::async_trait;
use common::EntityId;
use domain::{Category, Product, User};

use crate::Result;
use crate::outbox::{NewOutboxRecord, OutboxId};

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Loads a user by id, deleted or not.
    async fn get(&self, id: EntityId) -> Result<Option<User>>;

    async fn find_by_username(&self, username: &str) -> Result<Option<User>>;

    /// Inserts or updates the row. Pending events on `user` are ignored.
    async fn save(&self, user: &User) -> Result<()>;

    async fn count(&self) -> Result<u64>;
}

#[async_trait]
pub trait CategoryRepository: Send + Sync {
    async fn get(&self, id: EntityId) -> Result<Option<Category>>;

    async fn find_by_name(&self, name: &str) -> Result<Option<Category>>;

    async fn save(&self, category: &Category) -> Result<()>;

    async fn count(&self) -> Result<u64>;
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    async fn get(&self, id: EntityId) -> Result<Option<Product>>;

    async fn save(&self, product: &Product) -> Result<()>;

    async fn count(&self) -> Result<u64>;
}

/// Write side of the outbox, used inside business transactions.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Inserts a `pending` record and returns its id.
    async fn add(&self, record: NewOutboxRecord) -> Result<OutboxId>;

    async fn count(&self) -> Result<u64>;
}
