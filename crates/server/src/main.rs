//! Relay service entry point.

use std::sync::Arc;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use outbox::{
    Broker, HttpSearchIndex, InMemoryBroker, InMemorySearchIndex, NatsBroker, SearchIndex,
};
use server::{AppState, Config, LogFormat, Pipeline, ServerError};
use store::{Database, InMemoryDatabase, OutboxStore, PgDatabase};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn serve<D>(config: Config, db: D, metrics_handle: PrometheusHandle) -> Result<(), ServerError>
where
    D: Database + OutboxStore,
{
    let broker: Arc<dyn Broker> = match &config.nats_url {
        Some(url) => Arc::new(NatsBroker::connect(url).await?),
        None => {
            tracing::warn!("NATS_URL not set, using the in-memory broker");
            Arc::new(InMemoryBroker::new())
        }
    };
    let index: Arc<dyn SearchIndex> = match &config.search_url {
        Some(url) => Arc::new(HttpSearchIndex::new(url.as_str(), config.search_timeout)?),
        None => {
            tracing::warn!("SEARCH_URL not set, using the in-memory search index");
            Arc::new(InMemorySearchIndex::new())
        }
    };

    let pipeline = Pipeline::start(&config, db.clone(), broker, index).await?;

    let state = Arc::new(AppState {
        outbox: Arc::new(db),
    });
    let app = server::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting relay service");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pipeline.shutdown().await;
    tracing::info!("server shut down gracefully");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    // 1. Configuration and tracing
    let config = Config::from_env()?;
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;

    // 3. Pick the database backend and run
    match config.database_url.clone() {
        Some(url) => {
            let db = PgDatabase::connect(&url, config.database_max_connections).await?;
            db.run_migrations().await?;
            tracing::info!("connected to PostgreSQL, migrations applied");
            serve(config, db, metrics_handle).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory database");
            serve(config, InMemoryDatabase::new(), metrics_handle).await
        }
    }
}
