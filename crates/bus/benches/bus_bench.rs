use std::sync::Arc;

use bus::MessageBus;
use bus::handlers::{LogNotifier, OutboxPolicy, register_all};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{CreateCategory, CreateProduct, RegisterUser};
use store::InMemoryDatabase;

fn bench_register_user(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let db = InMemoryDatabase::new();
    let (bus, dispatcher) = register_all(
        MessageBus::builder(db),
        Arc::new(LogNotifier),
        OutboxPolicy::default(),
    )
    .unwrap()
    .build();
    let _dispatcher = rt.block_on(async { dispatcher.spawn() });
    let mut n = 0u64;

    c.bench_function("bus/register_user", |b| {
        b.iter(|| {
            n += 1;
            let cmd = RegisterUser::new(format!("user-{n}"), format!("user-{n}@example.com"));
            rt.block_on(async { bus.handle(cmd).await.unwrap() });
        });
    });
}

fn bench_create_product(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let db = InMemoryDatabase::new();
    let (bus, dispatcher) = register_all(
        MessageBus::builder(db),
        Arc::new(LogNotifier),
        OutboxPolicy::default(),
    )
    .unwrap()
    .build();
    let _dispatcher = rt.block_on(async { dispatcher.spawn() });
    let category = rt.block_on(async { bus.handle(CreateCategory::new("Books")).await.unwrap() });

    c.bench_function("bus/create_product_with_outbox", |b| {
        b.iter(|| {
            rt.block_on(async {
                bus.handle(CreateProduct::new("Dune", "A novel", 1299, category))
                    .await
                    .unwrap()
            });
        });
    });
}

criterion_group!(benches, bench_register_user, bench_create_product);
criterion_main!(benches);
