//! Integration tests for the relay service.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use domain::{CreateCategory, CreateProduct, DeleteProduct};
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::{InMemoryBroker, InMemorySearchIndex, PRODUCTS_INDEX};
use server::{AppState, Config, Pipeline};
use store::{Database, InMemoryDatabase, NewOutboxRecord, Session};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup(db: &InMemoryDatabase) -> axum::Router {
    let state = Arc::new(AppState {
        outbox: Arc::new(db.clone()),
    });
    server::create_app(state, get_metrics_handle())
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

fn fast_config() -> Config {
    Config {
        outbox_poll_interval: Duration::from_millis(10),
        ..Config::default()
    }
}

#[tokio::test]
async fn test_health_check() {
    let db = InMemoryDatabase::new();

    let (status, json) = get_json(setup(&db), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_outbox_stats_counts_pending_records() {
    let db = InMemoryDatabase::new();
    let outbox = db.outbox(Session::detached());
    for i in 0..3 {
        outbox
            .add(NewOutboxRecord::new(
                "product.created",
                "product",
                format!("p-{i}"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
    }

    let (status, json) = get_json(setup(&db), "/outbox/stats").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["pending"], 3);
    assert_eq!(json["completed"], 0);
    assert_eq!(json["failed"], 0);
    assert!(json["oldest_pending_at"].is_string());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let db = InMemoryDatabase::new();
    let app = setup(&db);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let db = InMemoryDatabase::new();
    let response = setup(&db)
        .oneshot(
            Request::builder()
                .uri("/orders")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_pipeline_projects_committed_products() {
    let db = InMemoryDatabase::new();
    let index = InMemorySearchIndex::new();
    let pipeline = Pipeline::start(
        &fast_config(),
        db.clone(),
        Arc::new(InMemoryBroker::new()),
        Arc::new(index.clone()),
    )
    .await
    .unwrap();

    let books = pipeline
        .bus()
        .handle(CreateCategory::new("Books"))
        .await
        .unwrap();
    let dune = pipeline
        .bus()
        .handle(CreateProduct::new("Dune", "A novel", 1299, books))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while index.get(PRODUCTS_INDEX, &dune.to_string()).await.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("product indexed");

    pipeline.bus().handle(DeleteProduct::new(dune)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while index.get(PRODUCTS_INDEX, &dune.to_string()).await.is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("product removed from index");

    tokio::time::timeout(Duration::from_secs(10), pipeline.shutdown())
        .await
        .expect("pipeline stopped");

    let (_, json) = get_json(setup(&db), "/outbox/stats").await;
    assert_eq!(json["completed"], 2);
    assert_eq!(json["pending"], 0);
}

#[tokio::test]
async fn test_pipeline_refuses_a_lease_shorter_than_a_batch() {
    let config = Config {
        outbox_batch_size: 10,
        outbox_publish_timeout: Duration::from_secs(1),
        outbox_stale_lease: Duration::from_secs(5),
        ..fast_config()
    };

    let result = Pipeline::start(
        &config,
        InMemoryDatabase::new(),
        Arc::new(InMemoryBroker::new()),
        Arc::new(InMemorySearchIndex::new()),
    )
    .await;

    assert!(matches!(
        result,
        Err(server::ServerError::Outbox(outbox::OutboxError::Config(_)))
    ));
}

#[tokio::test]
async fn test_pipeline_commands_survive_a_tiny_event_channel() {
    let db = InMemoryDatabase::new();
    let config = Config {
        bus_event_channel_capacity: 1,
        bus_max_concurrent_handlers: 1,
        ..fast_config()
    };
    let pipeline = Pipeline::start(
        &config,
        db.clone(),
        Arc::new(InMemoryBroker::new()),
        Arc::new(InMemorySearchIndex::new()),
    )
    .await
    .unwrap();

    for name in ["Books", "Music", "Games"] {
        tokio::time::timeout(
            Duration::from_secs(2),
            pipeline.bus().handle(CreateCategory::new(name)),
        )
        .await
        .expect("command returns")
        .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(10), pipeline.shutdown())
        .await
        .expect("pipeline stopped");
    assert_eq!(db.categories(Session::detached()).count().await.unwrap(), 3);
}
