//! Entity lifecycles as the handlers drive them.

use domain::{Category, DomainError, DomainEvent, Entity, EventKind, Product, User};

fn kinds(events: Vec<DomainEvent>) -> Vec<EventKind> {
    events.iter().map(DomainEvent::kind).collect()
}

#[test]
fn product_lifecycle_raises_events_in_order() {
    let books = Category::create("Books").unwrap();
    let mut dune = Product::create("Dune", "A novel", 1299, &books).unwrap();
    dune.change_price(999).unwrap();
    dune.change_price(999).unwrap();
    dune.delete().unwrap();

    assert_eq!(
        kinds(dune.events_mut().drain()),
        vec![
            EventKind::ProductCreated,
            EventKind::ProductPriceChanged,
            EventKind::ProductDeleted,
        ]
    );
    assert!(dune.events().is_empty());
    assert!(dune.is_deleted());
}

#[test]
fn deleted_product_rejects_changes() {
    let books = Category::create("Books").unwrap();
    let mut dune = Product::create("Dune", "A novel", 1299, &books).unwrap();
    dune.delete().unwrap();
    dune.events_mut().drain();

    assert_eq!(
        dune.change_price(1).unwrap_err(),
        DomainError::Deleted {
            entity: "product",
            id: dune.id(),
        }
    );
    assert!(dune.delete().is_err());
    assert!(dune.events().is_empty());
}

#[test]
fn negative_price_is_rejected_without_events() {
    let books = Category::create("Books").unwrap();
    assert_eq!(
        Product::create("Dune", "", -1, &books).unwrap_err(),
        DomainError::NegativePrice(-1)
    );

    let mut dune = Product::create("Dune", "", 100, &books).unwrap();
    dune.events_mut().drain();
    assert!(dune.change_price(-5).is_err());
    assert_eq!(dune.price_cents(), 100);
    assert!(dune.events().is_empty());
}

#[test]
fn user_events_carry_the_user_id() {
    let mut alice = User::register("alice", "alice@example.com").unwrap();
    alice.delete().unwrap();

    let events = alice.events_mut().drain();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.entity_id() == alice.id()));
    assert_eq!(events[1].kind(), EventKind::UserDeleted);
}
