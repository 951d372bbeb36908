//! Message bus scenarios against the in-memory backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bus::handlers::{
    ChangeProductPriceHandler, CreateCategoryHandler, CreateProductHandler, DeleteProductHandler,
    LogNotifier, Notifier, OutboxPolicy, RegisterUserHandler, register_all,
};
use bus::{AppError, BusConfig, CommandHandler, EventHandler, MessageBus, Result, UnitOfWork};
use domain::{
    ChangeProductPrice, CreateCategory, CreateProduct, DeleteProduct, DomainEvent, Entity,
    EntityId, EventKind, RegisterUser, User,
};
use store::{Database, InMemoryDatabase, OutboxStatus, Session, StoreError};

#[derive(Default)]
struct RecordingNotifier(Mutex<Vec<String>>);

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn welcome(&self, _user_id: EntityId, username: &str, _email: &str) -> Result<()> {
        self.0.lock().unwrap().push(username.to_string());
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingHandler(Arc<Mutex<Vec<EventKind>>>);

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        self.0.lock().unwrap().push(event.kind());
        Ok(())
    }
}

fn catalog_bus(
    db: &InMemoryDatabase,
    recorder: &RecordingHandler,
) -> (MessageBus<InMemoryDatabase>, bus::EventDispatcher) {
    MessageBus::builder(db.clone())
        .add_handler::<CreateCategory, _>(CreateCategoryHandler)
        .unwrap()
        .add_handler::<CreateProduct, _>(CreateProductHandler::default())
        .unwrap()
        .add_handler::<ChangeProductPrice, _>(ChangeProductPriceHandler::default())
        .unwrap()
        .add_handler::<DeleteProduct, _>(DeleteProductHandler::default())
        .unwrap()
        .add_event_handler(EventKind::CategoryCreated, recorder.clone())
        .unwrap()
        .add_event_handler(EventKind::ProductCreated, recorder.clone())
        .unwrap()
        .add_event_handler(EventKind::ProductPriceChanged, recorder.clone())
        .unwrap()
        .add_event_handler(EventKind::ProductDeleted, recorder.clone())
        .unwrap()
        .build()
}

#[tokio::test]
async fn duplicate_username_is_rejected_and_dispatches_once() {
    let db = InMemoryDatabase::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let (bus, dispatcher) = register_all(
        MessageBus::builder(db.clone()),
        notifier.clone(),
        OutboxPolicy::default(),
    )
    .unwrap()
    .build();
    let dispatcher = dispatcher.spawn();

    bus.handle(RegisterUser::new("alice", "alice@example.com"))
        .await
        .unwrap();
    let err = bus
        .handle(RegisterUser::new("alice", "other@example.com"))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(db.users(Session::detached()).count().await.unwrap(), 1);

    drop(bus);
    dispatcher.join().await;
    assert_eq!(*notifier.0.lock().unwrap(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn product_with_missing_category_writes_nothing() {
    let db = InMemoryDatabase::new();
    let recorder = RecordingHandler::default();
    let (bus, dispatcher) = catalog_bus(&db, &recorder);
    let dispatcher = dispatcher.spawn();

    let missing = EntityId::new();
    let err = bus
        .handle(CreateProduct::new("Dune", "A novel", 1299, missing))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NotFound { entity: "category", id } if id == missing));
    assert_eq!(db.products(Session::detached()).count().await.unwrap(), 0);
    assert!(db.outbox_records().await.is_empty());

    drop(bus);
    dispatcher.join().await;
    assert!(recorder.0.lock().unwrap().is_empty());
}

#[tokio::test]
async fn product_lifecycle_writes_outbox_records_in_the_same_transaction() {
    let db = InMemoryDatabase::new();
    let recorder = RecordingHandler::default();
    let (bus, dispatcher) = catalog_bus(&db, &recorder);
    let dispatcher = dispatcher.spawn();

    let category_id = bus.handle(CreateCategory::new("Books")).await.unwrap();
    let product_id = bus
        .handle(CreateProduct::new("Dune", "A novel", 1299, category_id))
        .await
        .unwrap();
    bus.handle(ChangeProductPrice::new(product_id, 999))
        .await
        .unwrap();
    bus.handle(DeleteProduct::new(product_id)).await.unwrap();

    let records = db.outbox_records().await;
    let types: Vec<_> = records.iter().map(|r| r.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["product.created", "product.updated", "product.deleted"]
    );
    for record in &records {
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.aggregate_type, "product");
        assert_eq!(record.aggregate_id, product_id.to_string());
        assert_eq!(record.max_retries, 5);
    }

    // Deleted products are not found by later commands.
    let err = bus
        .handle(ChangeProductPrice::new(product_id, 500))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound { entity: "product", .. }));

    drop(bus);
    dispatcher.join().await;
    let mut kinds = recorder.0.lock().unwrap().clone();
    kinds.sort();
    assert_eq!(
        kinds,
        vec![
            EventKind::CategoryCreated,
            EventKind::ProductCreated,
            EventKind::ProductPriceChanged,
            EventKind::ProductDeleted,
        ]
    );
}

#[tokio::test]
async fn commit_failure_returns_error_and_dispatches_nothing() {
    let db = InMemoryDatabase::new();
    let recorder = RecordingHandler::default();
    let (bus, dispatcher) = catalog_bus(&db, &recorder);
    let dispatcher = dispatcher.spawn();

    db.fail_next_commit();
    let err = bus.handle(CreateCategory::new("Books")).await.unwrap_err();

    assert!(matches!(err, AppError::Store(StoreError::CommitFailed(_))));
    assert_eq!(db.categories(Session::detached()).count().await.unwrap(), 0);

    drop(bus);
    dispatcher.join().await;
    assert!(recorder.0.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unregistered_command_has_no_handler() {
    let db = InMemoryDatabase::new();
    let (bus, _dispatcher) = MessageBus::builder(db).build();

    let err = bus
        .handle(RegisterUser::new("alice", "alice@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NoHandler(kind) if kind == "register_user"));
}

#[tokio::test]
async fn registering_a_handler_twice_fails() {
    let result = MessageBus::builder(InMemoryDatabase::new())
        .add_handler::<RegisterUser, _>(RegisterUserHandler)
        .unwrap()
        .add_handler::<RegisterUser, _>(RegisterUserHandler);
    assert!(matches!(result, Err(AppError::DuplicateHandler(_))));

    let result = register_all(
        MessageBus::builder(InMemoryDatabase::new()),
        Arc::new(LogNotifier),
        OutboxPolicy::default(),
    )
    .unwrap()
    .add_event_handler(EventKind::UserRegistered, RecordingHandler::default());
    assert!(matches!(result, Err(AppError::DuplicateHandler(_))));
}

struct PanickingRegistration;

#[async_trait]
impl CommandHandler<RegisterUser, InMemoryDatabase> for PanickingRegistration {
    async fn handle(
        &self,
        uow: &mut UnitOfWork<InMemoryDatabase>,
        cmd: RegisterUser,
    ) -> Result<EntityId> {
        uow.run(move |uow| {
            Box::pin(async move {
                let mut user = User::register(cmd.username, cmd.email)?;
                uow.users().save(&mut user).await?;
                panic!("bug after save");
            })
        })
        .await
    }
}

#[tokio::test]
async fn panic_inside_a_command_rolls_back_and_propagates() {
    let db = InMemoryDatabase::new();
    let (bus, _dispatcher) = MessageBus::builder(db.clone())
        .add_handler::<RegisterUser, _>(PanickingRegistration)
        .unwrap()
        .build();

    let joined = tokio::spawn(async move {
        bus.handle(RegisterUser::new("mallory", "m@example.com"))
            .await
    })
    .await;

    assert!(joined.unwrap_err().is_panic());
    assert_eq!(db.users(Session::detached()).count().await.unwrap(), 0);
    assert_eq!(db.rollback_count(), 1);
}

struct Stuck;

#[async_trait]
impl EventHandler for Stuck {
    async fn handle(&self, _event: &DomainEvent) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test]
async fn stuck_event_handler_never_blocks_commands() {
    let db = InMemoryDatabase::new();
    let (bus, dispatcher) = MessageBus::builder(db.clone())
        .with_config(BusConfig {
            event_channel_capacity: 1,
            max_concurrent_handlers: 1,
            shutdown_grace: Duration::from_millis(50),
            ..BusConfig::default()
        })
        .add_handler::<CreateCategory, _>(CreateCategoryHandler)
        .unwrap()
        .add_event_handler(EventKind::CategoryCreated, Stuck)
        .unwrap()
        .build();
    let dispatcher = dispatcher.spawn();

    for name in ["Books", "Music", "Games", "Garden"] {
        tokio::time::timeout(Duration::from_secs(2), bus.handle(CreateCategory::new(name)))
            .await
            .expect("command returns while the handler is stuck")
            .unwrap();
    }
    assert_eq!(db.categories(Session::detached()).count().await.unwrap(), 4);

    tokio::time::timeout(Duration::from_secs(3), dispatcher.shutdown())
        .await
        .expect("dispatcher stops after the grace period");
}

/// Registers the user and, in a second transaction, a guest account.
struct RegisterWithGuest;

#[async_trait]
impl CommandHandler<RegisterUser, InMemoryDatabase> for RegisterWithGuest {
    async fn handle(
        &self,
        uow: &mut UnitOfWork<InMemoryDatabase>,
        cmd: RegisterUser,
    ) -> Result<EntityId> {
        let id = uow
            .run(move |uow| {
                Box::pin(async move {
                    let mut user = User::register(cmd.username, cmd.email)?;
                    uow.users().save(&mut user).await?;
                    Ok(user.id())
                })
            })
            .await?;
        uow.run(|uow| {
            Box::pin(async move {
                let mut guest = User::register("guest", "guest@example.com")?;
                uow.users().save(&mut guest).await?;
                Ok(())
            })
        })
        .await?;
        Ok(id)
    }
}

#[tokio::test]
async fn events_of_every_transaction_in_a_command_are_dispatched() {
    let db = InMemoryDatabase::new();
    let recorder = RecordingHandler::default();
    let (bus, dispatcher) = MessageBus::builder(db.clone())
        .add_handler::<RegisterUser, _>(RegisterWithGuest)
        .unwrap()
        .add_event_handler(EventKind::UserRegistered, recorder.clone())
        .unwrap()
        .build();
    let dispatcher = dispatcher.spawn();

    bus.handle(RegisterUser::new("alice", "alice@example.com"))
        .await
        .unwrap();

    drop(bus);
    dispatcher.join().await;
    assert_eq!(
        *recorder.0.lock().unwrap(),
        vec![EventKind::UserRegistered, EventKind::UserRegistered]
    );
    assert_eq!(db.users(Session::detached()).count().await.unwrap(), 2);
}
