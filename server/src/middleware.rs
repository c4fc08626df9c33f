use std::sync::Arc;

use axum::{http::Request, middleware::Next, response::Response};
use uuid::Uuid;

use super::RequestStateInner;
use crate::access::AuthState;

/// Initializes per-request state.
pub async fn init_request_state<B>(mut req: Request<B>, next: Next<B>) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let req_state = Arc::new(RequestStateInner {
        auth: AuthState::new(),
        request_id: request_id.clone(),
    });

    req.extensions_mut().insert(req_state);

    let mut response = next.run(req).await;

    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("X-Request-ID", value);
    }

    response
}

/// Adds standard security headers to every response.
pub async fn security_headers<B>(req: Request<B>, next: Next<B>) -> Response {
    let mut response = next.run(req).await;

    let headers = response.headers_mut();
    headers.insert("X-Frame-Options", "DENY".parse().unwrap());
    headers.insert("X-Content-Type-Options", "nosniff".parse().unwrap());
    headers.insert(
        "Strict-Transport-Security",
        "max-age=31536000; includeSubDomains".parse().unwrap(),
    );
    headers.insert(
        "Content-Security-Policy",
        "default-src 'none'; frame-ancestors 'none'".parse().unwrap(),
    );
    headers.insert("Referrer-Policy", "no-referrer".parse().unwrap());

    response
}
