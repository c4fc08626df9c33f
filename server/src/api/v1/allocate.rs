use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;
use tracing::instrument;

use super::{optional_header, required_owner_id};
use crate::allocation::{self, AllocateRequest};
use crate::database::entity::sandbox::{SandboxModel, SandboxStatus};
use crate::error::ServerResult;
use crate::{RequestState, State};

#[derive(Debug, Serialize)]
pub(crate) struct AllocateResponse {
    sandbox_id: String,
    name: String,
    external_id: String,
    status: SandboxStatus,
    allocated_at: i64,
    expires_at: i64,

    /// Whether an existing allocation was returned.
    idempotent: bool,
}

impl AllocateResponse {
    fn new(sandbox: SandboxModel, idempotent: bool) -> Self {
        Self {
            expires_at: sandbox.expires_at().unwrap_or(0),
            sandbox_id: sandbox.sandbox_id,
            name: sandbox.name,
            external_id: sandbox.external_id,
            status: sandbox.status,
            allocated_at: sandbox.allocated_at,
            idempotent,
        }
    }
}

/// Allocates a sandbox to the requesting lab session.
///
/// Returns 201 for a fresh claim and 200 when an existing live
/// allocation was replayed via the idempotency key.
#[instrument(skip_all, fields(owner))]
pub(crate) async fn allocate(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    headers: HeaderMap,
) -> ServerResult<(StatusCode, Json<AllocateResponse>)> {
    req_state.auth.require_client()?;

    let owner = required_owner_id(&headers)?;
    tracing::Span::current().record("owner", owner.as_str());

    let request = AllocateRequest {
        owner,
        idempotency_key: optional_header(&headers, "Idempotency-Key"),
        lab_tag: optional_header(&headers, "X-Lab-Tag"),
        name_prefix: optional_header(&headers, "X-Name-Prefix"),
    };

    let outcome = allocation::allocate(&state, request).await?;

    let status_code = if outcome.idempotent {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    tracing::info!(
        request_id = %req_state.request_id,
        sandbox_id = %outcome.sandbox.sandbox_id,
        idempotent = outcome.idempotent,
        "Sandbox allocated"
    );

    Ok((
        status_code,
        Json(AllocateResponse::new(outcome.sandbox, outcome.idempotent)),
    ))
}
