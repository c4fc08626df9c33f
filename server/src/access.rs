//! Bearer-token access control.
//!
//! Two static tokens: one for the client surface (lab sessions) and
//! one for the admin surface. The middleware records what the caller
//! presented; enforcement happens at the handlers.

use axum::{http::Request, middleware::Next, response::Response};
use tokio::sync::OnceCell;

use crate::error::{ServerError, ServerResult};
use crate::{RequestState, State};

/// Access level granted by the presented bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLevel {
    /// The client surface token.
    Client,

    /// The admin surface token.
    Admin,
}

/// Auth state.
#[derive(Debug)]
pub struct AuthState {
    /// The granted access level, if a valid token was presented.
    level: OnceCell<AuthLevel>,
}

impl AuthState {
    /// Returns an auth state with no granted access.
    pub fn new() -> Self {
        Self {
            level: OnceCell::new(),
        }
    }

    fn grant(&self, level: AuthLevel) {
        let _ = self.level.set(level);
    }

    /// Requires the client surface token. The admin token also passes.
    pub fn require_client(&self) -> ServerResult<()> {
        match self.level.get() {
            Some(AuthLevel::Client) | Some(AuthLevel::Admin) => Ok(()),
            None => Err(ServerError::Unauthorized),
        }
    }

    /// Requires the admin surface token.
    pub fn require_admin(&self) -> ServerResult<()> {
        match self.level.get() {
            Some(AuthLevel::Admin) => Ok(()),
            Some(AuthLevel::Client) => Err(ServerError::Forbidden),
            None => Err(ServerError::Unauthorized),
        }
    }
}

fn parse_bearer_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ").map(str::trim)
}

/// Performs auth.
pub async fn apply_auth<B>(req: Request<B>, next: Next<B>) -> Response {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|bytes| bytes.to_str().ok())
        .and_then(parse_bearer_token);

    if let Some(token) = token {
        let state = req.extensions().get::<State>().unwrap();
        let req_state = req.extensions().get::<RequestState>().unwrap();

        if token == state.config.admin_token {
            req_state.auth.grant(AuthLevel::Admin);
        } else if token == state.config.api_token {
            req_state.auth.grant(AuthLevel::Client);
        } else {
            tracing::debug!("Ignoring unknown bearer token");
        }
    }

    next.run(req).await
}
