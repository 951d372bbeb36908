//! The entity capability and its owned event queue.

use common::EntityId;

use crate::events::DomainEvent;

/// Events raised by an entity that have not been harvested yet.
///
/// The queue is owned by the entity. [`EventQueue::drain`] is the only way
/// to read events out, and it empties the queue in the same call, so an
/// event can never be collected twice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQueue {
    events: Vec<DomainEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a newly raised event.
    pub fn raise(&mut self, event: DomainEvent) {
        self.events.push(event);
    }

    /// Takes every queued event, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Peeks at queued events without draining them.
    pub fn iter(&self) -> impl Iterator<Item = &DomainEvent> {
        self.events.iter()
    }
}

/// A domain object with a stable identity, a soft-delete marker and a
/// buffer of raised domain events.
pub trait Entity: Send + Sync {
    /// Entity kind name, used in logs and error messages.
    const KIND: &'static str;

    fn id(&self) -> EntityId;

    fn is_deleted(&self) -> bool;

    fn events(&self) -> &EventQueue;

    fn events_mut(&mut self) -> &mut EventQueue;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DomainEvent, UserDeleted};
    use chrono::Utc;

    fn event() -> DomainEvent {
        DomainEvent::UserDeleted(UserDeleted {
            user_id: EntityId::new(),
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn drain_returns_events_once() {
        let mut queue = EventQueue::new();
        queue.raise(event());
        queue.raise(event());

        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn raise_after_drain_starts_fresh() {
        let mut queue = EventQueue::new();
        queue.raise(event());
        queue.drain();

        let late = event();
        queue.raise(late.clone());
        assert_eq!(queue.drain(), vec![late]);
    }
}
