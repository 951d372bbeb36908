//! Seen-tracked repositories.
//!
//! A [`Tracked`] repository records every entity that passes through it. When
//! an entity is saved its event queue is drained into the seen list, so the
//! events stay with the unit of work even after the caller drops the entity.
//! Nothing in the seen list leaves it until [`SeenTracked::drain_events`].

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use common::EntityId;
use domain::{Category, DomainEvent, Entity, Product, User};
use store::{CategoryRepository, ProductRepository, UserRepository};

/// One entity seen during the current transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct SeenEntity {
    pub kind: &'static str,
    pub id: EntityId,
    pub events: Vec<DomainEvent>,
}

#[derive(Debug, Default)]
pub struct SeenList {
    entries: Mutex<Vec<SeenEntity>>,
}

impl SeenList {
    fn entries(&self) -> MutexGuard<'_, Vec<SeenEntity>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a loaded entity. Loads carry no events.
    pub fn record_loaded<E: Entity>(&self, entity: &E) {
        self.entries().push(SeenEntity {
            kind: E::KIND,
            id: entity.id(),
            events: Vec::new(),
        });
    }

    /// Records a written entity and takes its pending events.
    pub fn record_written<E: Entity>(&self, entity: &mut E) {
        let events = entity.events_mut().drain();
        self.entries().push(SeenEntity {
            kind: E::KIND,
            id: entity.id(),
            events,
        });
    }

    pub fn reset(&self) {
        self.entries().clear();
    }

    /// Empties the list, returning the events in the order they were recorded.
    pub fn drain_events(&self) -> Vec<DomainEvent> {
        std::mem::take(&mut *self.entries())
            .into_iter()
            .flat_map(|seen| seen.events)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn snapshot(&self) -> Vec<SeenEntity> {
        self.entries().clone()
    }
}

/// A repository whose seen list the unit of work can reset and drain.
#[async_trait]
pub trait SeenTracked: Send + Sync {
    fn reset(&self);

    async fn drain_events(&self) -> Vec<DomainEvent>;

    fn seen_count(&self) -> usize;
}

/// Wraps a repository with a seen list.
pub struct Tracked<R: ?Sized> {
    inner: Box<R>,
    seen: SeenList,
}

impl<R: ?Sized> Tracked<R> {
    pub fn new(inner: Box<R>) -> Self {
        Self {
            inner,
            seen: SeenList::default(),
        }
    }

    pub fn seen(&self) -> &SeenList {
        &self.seen
    }
}

#[async_trait]
impl<R: ?Sized + Send + Sync> SeenTracked for Tracked<R> {
    fn reset(&self) {
        self.seen.reset();
    }

    async fn drain_events(&self) -> Vec<DomainEvent> {
        self.seen.drain_events()
    }

    fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

pub type TrackedUsers = Tracked<dyn UserRepository>;
pub type TrackedCategories = Tracked<dyn CategoryRepository>;
pub type TrackedProducts = Tracked<dyn ProductRepository>;

impl Tracked<dyn UserRepository> {
    pub async fn get(&self, id: EntityId) -> store::Result<Option<User>> {
        let user = self.inner.get(id).await?;
        if let Some(user) = &user {
            self.seen.record_loaded(user);
        }
        Ok(user)
    }

    pub async fn find_by_username(&self, username: &str) -> store::Result<Option<User>> {
        let user = self.inner.find_by_username(username).await?;
        if let Some(user) = &user {
            self.seen.record_loaded(user);
        }
        Ok(user)
    }

    /// Saves `user` and moves its pending events into the seen list.
    pub async fn save(&self, user: &mut User) -> store::Result<()> {
        self.inner.save(user).await?;
        self.seen.record_written(user);
        Ok(())
    }

    pub async fn count(&self) -> store::Result<u64> {
        self.inner.count().await
    }
}

impl Tracked<dyn CategoryRepository> {
    pub async fn get(&self, id: EntityId) -> store::Result<Option<Category>> {
        let category = self.inner.get(id).await?;
        if let Some(category) = &category {
            self.seen.record_loaded(category);
        }
        Ok(category)
    }

    pub async fn find_by_name(&self, name: &str) -> store::Result<Option<Category>> {
        let category = self.inner.find_by_name(name).await?;
        if let Some(category) = &category {
            self.seen.record_loaded(category);
        }
        Ok(category)
    }

    pub async fn save(&self, category: &mut Category) -> store::Result<()> {
        self.inner.save(category).await?;
        self.seen.record_written(category);
        Ok(())
    }

    pub async fn count(&self) -> store::Result<u64> {
        self.inner.count().await
    }
}

impl Tracked<dyn ProductRepository> {
    pub async fn get(&self, id: EntityId) -> store::Result<Option<Product>> {
        let product = self.inner.get(id).await?;
        if let Some(product) = &product {
            self.seen.record_loaded(product);
        }
        Ok(product)
    }

    pub async fn save(&self, product: &mut Product) -> store::Result<()> {
        self.inner.save(product).await?;
        self.seen.record_written(product);
        Ok(())
    }

    pub async fn count(&self) -> store::Result<u64> {
        self.inner.count().await
    }
}
