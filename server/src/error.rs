//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use displaydoc::Display;
use serde::Serialize;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error.
#[derive(Debug, Display)]
pub enum ServerError {
    // Generic responses
    /// The URL you requested was not found.
    NotFound,

    /// Unauthorized.
    Unauthorized,

    /// Admin access required.
    Forbidden,

    /// The server encountered an internal error or misconfiguration.
    InternalServerError,

    // Specialized responses
    /// No sandboxes available in pool.
    NoSandboxesAvailable {
        /// Suggested delay before the client retries, in seconds.
        retry_after: u64,
    },

    /// Sandbox is not owned by the requesting client.
    NotOwner,

    /// Sandbox allocation has expired.
    AllocationExpired,

    /// Upstream circuit breaker is open. Retry after {retry_after}s.
    CircuitOpen { retry_after: u64 },

    /// Rate limit exceeded. Retry after {retry_after}s.
    RateLimited { retry_after: u64 },

    /// Database error: {0}
    DatabaseError(AnyError),

    /// Upstream error: {0}
    UpstreamError(AnyError),

    /// General request error: {0}
    RequestError(AnyError),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    code: u16,
    error: String,
    message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl ServerError {
    pub fn database_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::DatabaseError(AnyError::new(error))
    }

    pub fn upstream_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::UpstreamError(AnyError::new(error))
    }

    pub fn request_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::RequestError(AnyError::new(error))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::InternalServerError => "InternalServerError",

            Self::NoSandboxesAvailable { .. } => "NoSandboxesAvailable",
            Self::NotOwner => "NotOwner",
            Self::AllocationExpired => "AllocationExpired",
            Self::CircuitOpen { .. } => "CircuitOpen",
            Self::RateLimited { .. } => "RateLimited",
            Self::DatabaseError(_) => "DatabaseError",
            Self::UpstreamError(_) => "UpstreamError",
            Self::RequestError(_) => "RequestError",
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::NoSandboxesAvailable { retry_after } => Some(*retry_after),
            Self::CircuitOpen { retry_after } => Some(*retry_after),
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Returns a version of this error for clients.
    fn into_clients(self) -> Self {
        match self {
            Self::DatabaseError(_) => Self::InternalServerError,
            Self::UpstreamError(_) => Self::InternalServerError,

            _ => self,
        }
    }

    fn http_status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,

            Self::NoSandboxesAvailable { .. } => StatusCode::CONFLICT,
            Self::NotOwner => StatusCode::FORBIDDEN,
            Self::AllocationExpired => StatusCode::FORBIDDEN,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::RequestError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl StdError for ServerError {}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(self, Self::DatabaseError(_) | Self::UpstreamError(_)) {
            tracing::error!("{:?}", self);
        }

        let sanitized = self.into_clients();

        let status_code = sanitized.http_status_code();
        let retry_after = sanitized.retry_after();
        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            message: sanitized.to_string(),
            error: sanitized.name().to_string(),
            retry_after,
        };

        let mut response = (status_code, Json(error_response)).into_response();

        if let Some(retry_after) = retry_after {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}
