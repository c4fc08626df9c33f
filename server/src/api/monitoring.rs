//! Health checks and metrics exposition.

use axum::extract::Extension;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::breaker::BreakerSnapshot;
use crate::error::ServerResult;
use crate::State;

pub(crate) fn get_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

/// Prometheus metrics endpoint.
///
/// Pool gauges are recomputed at most once a minute regardless of
/// scrape frequency.
async fn metrics(Extension(state): Extension<State>) -> ServerResult<Response> {
    let db = state.database().await?;

    if let Err(e) = state.metrics.update_pool_gauges(db).await {
        tracing::warn!("Could not update pool gauges: {}", e);
    }

    let body = state.metrics.render()?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

/// Liveness probe.
async fn healthz() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().timestamp(),
    }))
}

#[derive(Serialize)]
struct ReadyzResponse {
    status: &'static str,
    timestamp: i64,
    database: &'static str,
    breaker: BreakerSnapshot,
}

/// Readiness probe. Checks store connectivity and reports the state
/// of the upstream circuit.
async fn readyz(Extension(state): Extension<State>) -> Response {
    let timestamp = Utc::now().timestamp();
    let breaker = state.breaker.snapshot();

    let database_ok = match state.database().await {
        Ok(db) => db.ping().await.is_ok(),
        Err(_) => false,
    };

    if database_ok {
        Json(ReadyzResponse {
            status: "ready",
            timestamp,
            database: "ok",
            breaker,
        })
        .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyzResponse {
                status: "not_ready",
                timestamp,
                database: "error",
                breaker,
            }),
        )
            .into_response()
    }
}
