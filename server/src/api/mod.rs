//! HTTP API.

mod admin;
mod monitoring;
mod v1;

use axum::Router;

pub(crate) fn get_router() -> Router {
    Router::new()
        .merge(v1::get_router())
        .merge(admin::get_router())
        .merge(monitoring::get_router())
}
