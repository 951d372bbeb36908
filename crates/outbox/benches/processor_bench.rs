use std::sync::Arc;
use std::time::Duration;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use outbox::{InMemoryBroker, OutboxMessage, OutboxProcessor, ProcessorConfig};
use store::{Database, InMemoryDatabase, NewOutboxRecord, OutboxId, OutboxRecord, Session};

fn record(i: usize) -> NewOutboxRecord {
    NewOutboxRecord::new(
        "product.created",
        "product",
        format!("p-{i}"),
        serde_json::json!({ "name": "Bench", "price_cents": 1299 }),
    )
}

fn seeded(rt: &tokio::runtime::Runtime, count: usize) -> InMemoryDatabase {
    let db = InMemoryDatabase::new();
    rt.block_on(async {
        let outbox = db.outbox(Session::detached());
        for i in 0..count {
            outbox.add(record(i)).await.unwrap();
        }
    });
    db
}

fn bench_process_batch_50(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = ProcessorConfig {
        poll_interval: Duration::ZERO,
        ..ProcessorConfig::default()
    };

    c.bench_function("outbox/process_batch_50", |b| {
        b.iter_batched(
            || seeded(&rt, 50),
            |db| {
                let processor = OutboxProcessor::new(
                    Arc::new(db),
                    Arc::new(InMemoryBroker::new()),
                    config.clone(),
                )
                .unwrap();
                rt.block_on(async {
                    let report = processor.process_batch().await.unwrap();
                    assert_eq!(report.published, 50);
                });
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_envelope_encode(c: &mut Criterion) {
    let record = OutboxRecord::pending(OutboxId::new(1), record(1), chrono::Utc::now());

    c.bench_function("outbox/encode_envelope", |b| {
        b.iter(|| OutboxMessage::from_record(&record).to_bytes().unwrap());
    });
}

criterion_group!(benches, bench_process_batch_50, bench_envelope_encode);
criterion_main!(benches);
