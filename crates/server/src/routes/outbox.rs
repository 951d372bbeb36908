//! Outbox backlog endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct OutboxStatsResponse {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub oldest_pending_at: Option<String>,
}

/// GET /outbox/stats: row counts per status.
pub async fn stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<OutboxStatsResponse>, (StatusCode, Json<serde_json::Value>)> {
    let stats = state.outbox.stats().await.map_err(|e| {
        tracing::error!(error = %e, "failed to read outbox stats");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
    })?;

    metrics::gauge!("outbox_pending").set(stats.pending as f64);
    Ok(Json(OutboxStatsResponse {
        pending: stats.pending,
        processing: stats.processing,
        completed: stats.completed,
        failed: stats.failed,
        oldest_pending_at: stats.oldest_pending_at.map(|at| at.to_rfc3339()),
    }))
}
