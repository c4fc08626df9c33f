mod allocate;
mod sandboxes;

use axum::http::HeaderMap;
use axum::{
    routing::{get, post},
    Router,
};

use crate::error::{ServerError, ServerResult};

pub(crate) fn get_router() -> Router {
    Router::new()
        .route("/v1/allocate", post(allocate::allocate))
        .route(
            "/v1/sandboxes/:sandbox_id/mark-for-deletion",
            post(sandboxes::mark_for_deletion),
        )
        .route("/v1/sandboxes/:sandbox_id", get(sandboxes::get_sandbox))
}

/// Extracts the owner identity from the `X-Owner-ID` header.
pub(crate) fn required_owner_id(headers: &HeaderMap) -> ServerResult<String> {
    match optional_header(headers, "X-Owner-ID") {
        Some(owner) if !owner.is_empty() => Ok(owner),
        _ => Err(ServerError::RequestError(anyhow::anyhow!(
            "X-Owner-ID header is required"
        ))),
    }
}

pub(crate) fn optional_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
