//! Admin surface for pool management.

use axum::extract::{Extension, Query};
use axum::{
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::database::entity::sandbox::{SandboxModel, SandboxStatus};
use crate::database::{BrokerStore, PoolStats};
use crate::error::ServerResult;
use crate::jobs::cleanup::{self, CleanupOutcome};
use crate::jobs::sync::{self, SyncOutcome};
use crate::{RequestState, State};

pub(crate) fn get_router() -> Router {
    Router::new()
        .route("/v1/admin/sandboxes", get(list_sandboxes))
        .route("/v1/admin/stats", get(get_stats))
        .route("/v1/admin/sync", post(trigger_sync))
        .route("/v1/admin/cleanup", post(trigger_cleanup))
        .route("/v1/admin/bulk-delete", post(bulk_delete))
        .route("/v1/admin/purge-stale", post(purge_stale))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<SandboxStatus>,
    limit: Option<u64>,
    cursor: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    sandboxes: Vec<SandboxModel>,
    count: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
}

/// Lists sandboxes with optional status filtering and pagination.
#[instrument(skip_all)]
async fn list_sandboxes(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Query(query): Query<ListQuery>,
) -> ServerResult<Json<ListResponse>> {
    req_state.auth.require_admin()?;

    let db = state.database().await?;
    let limit = query.limit.unwrap_or(50).clamp(1, 100);

    let (sandboxes, cursor) = db
        .enumerate(query.status, query.cursor.as_deref(), limit)
        .await?;

    Ok(Json(ListResponse {
        count: sandboxes.len(),
        sandboxes,
        cursor,
    }))
}

/// Returns pool counts by status.
#[instrument(skip_all)]
async fn get_stats(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
) -> ServerResult<Json<PoolStats>> {
    req_state.auth.require_admin()?;

    let db = state.database().await?;
    Ok(Json(db.status_counts().await?))
}

/// Manually triggers an upstream sync.
#[instrument(skip_all)]
async fn trigger_sync(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
) -> ServerResult<Json<SyncOutcome>> {
    req_state.auth.require_admin()?;

    let outcome = sync::run_sync_once(&state).await?;
    Ok(Json(outcome))
}

/// Manually triggers a cleanup run.
#[instrument(skip_all)]
async fn trigger_cleanup(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
) -> ServerResult<Json<CleanupOutcome>> {
    req_state.auth.require_admin()?;

    let outcome = cleanup::run_cleanup_once(&state).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct BulkDeleteQuery {
    status: SandboxStatus,
}

#[derive(Debug, Serialize)]
struct BulkDeleteResponse {
    deleted: u64,
}

/// Removes all records in a status from the store.
///
/// Store-only: nothing is touched upstream. Intended for clearing
/// `stale` and `deletion_failed` records.
#[instrument(skip_all)]
async fn bulk_delete(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Query(query): Query<BulkDeleteQuery>,
) -> ServerResult<Json<BulkDeleteResponse>> {
    req_state.auth.require_admin()?;

    let db = state.database().await?;
    let deleted = db.bulk_delete_by_status(query.status).await?;

    tracing::info!(deleted, status = ?query.status, "Bulk-deleted sandboxes");

    Ok(Json(BulkDeleteResponse { deleted }))
}

#[derive(Debug, Deserialize)]
struct PurgeStaleQuery {
    grace_period_hours: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PurgeStaleResponse {
    deleted: u64,
    grace_period_hours: u64,
}

/// Removes `stale` records that have been idle past the grace period.
#[instrument(skip_all)]
async fn purge_stale(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Query(query): Query<PurgeStaleQuery>,
) -> ServerResult<Json<PurgeStaleResponse>> {
    req_state.auth.require_admin()?;

    let grace_period_hours = query.grace_period_hours.unwrap_or(24);
    let cutoff = Utc::now().timestamp() - (grace_period_hours * 3600) as i64;

    let db = state.database().await?;
    let deleted = db.purge_stale(cutoff).await?;

    tracing::info!(deleted, grace_period_hours, "Purged stale sandboxes");

    Ok(Json(PurgeStaleResponse {
        deleted,
        grace_period_hours,
    }))
}
