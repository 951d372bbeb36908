//! Relay service for the transactional write pipeline.
//!
//! Runs the outbox workers and the search consumer next to a small HTTP
//! surface for health, outbox backlog and Prometheus metrics.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use store::OutboxStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, LogFormat};
pub use error::{Result, ServerError};
pub use pipeline::Pipeline;

/// Shared state for the HTTP handlers.
pub struct AppState {
    pub outbox: Arc<dyn OutboxStore>,
}

/// Creates the Axum router with every route and its shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/outbox/stats", get(routes::outbox::stats))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
