use axum::extract::{Extension, Path};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use tracing::instrument;

use super::required_owner_id;
use crate::allocation;
use crate::database::entity::sandbox::{SandboxModel, SandboxStatus};
use crate::error::ServerResult;
use crate::{RequestState, State};

#[derive(Debug, Serialize)]
pub(crate) struct SandboxResponse {
    sandbox_id: String,
    name: String,
    external_id: String,
    status: SandboxStatus,
    allocated_to_owner: Option<String>,
    allocated_at: i64,
    expires_at: Option<i64>,
    lab_tag: Option<String>,
}

impl From<SandboxModel> for SandboxResponse {
    fn from(sandbox: SandboxModel) -> Self {
        Self {
            expires_at: sandbox.expires_at(),
            sandbox_id: sandbox.sandbox_id,
            name: sandbox.name,
            external_id: sandbox.external_id,
            status: sandbox.status,
            allocated_to_owner: sandbox.allocated_to_owner,
            allocated_at: sandbox.allocated_at,
            lab_tag: sandbox.lab_tag,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct MarkForDeletionResponse {
    sandbox_id: String,
    status: SandboxStatus,
    deletion_requested_at: i64,
}

/// Marks a sandbox for deletion when the lab session ends.
#[instrument(skip_all, fields(sandbox_id))]
pub(crate) async fn mark_for_deletion(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Path(sandbox_id): Path<String>,
    headers: HeaderMap,
) -> ServerResult<Json<MarkForDeletionResponse>> {
    req_state.auth.require_client()?;

    let owner = required_owner_id(&headers)?;
    let sandbox = allocation::mark_for_deletion(&state, &sandbox_id, &owner).await?;

    tracing::info!(
        request_id = %req_state.request_id,
        %sandbox_id,
        %owner,
        "Sandbox marked for deletion"
    );

    Ok(Json(MarkForDeletionResponse {
        deletion_requested_at: sandbox.deletion_requested_at.unwrap_or(0),
        sandbox_id: sandbox.sandbox_id,
        status: sandbox.status,
    }))
}

/// Gets sandbox details. The caller must own the allocation.
#[instrument(skip_all, fields(sandbox_id))]
pub(crate) async fn get_sandbox(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Path(sandbox_id): Path<String>,
    headers: HeaderMap,
) -> ServerResult<Json<SandboxResponse>> {
    req_state.auth.require_client()?;

    let owner = required_owner_id(&headers)?;
    let sandbox = allocation::get_owned(&state, &sandbox_id, &owner).await?;

    Ok(Json(sandbox.into()))
}
