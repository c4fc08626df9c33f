//! Per-client rate limiting.
//!
//! Token buckets keyed by client identity, with periodic eviction of
//! idle buckets so the map stays bounded.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Extension},
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::config::RateLimitConfig;
use crate::error::{ServerError, ServerResult};
use crate::State;

/// How often idle buckets are swept.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// How long a bucket may sit unused before eviction.
const IDLE_THRESHOLD: Duration = Duration::from_secs(600);

/// Paths exempt from rate limiting.
const EXEMPT_PATHS: &[&str] = &["/healthz", "/readyz", "/metrics"];

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, capacity: u32, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        self.tokens = (self.tokens + elapsed * refill_rate).min(f64::from(capacity));
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn retry_after(&self, refill_rate: f64) -> u64 {
        if self.tokens >= 1.0 {
            return 0;
        }

        ((1.0 - self.tokens) / refill_rate) as u64 + 1
    }
}

/// The shared rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_rate: f64,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    last_cleanup: Mutex<Instant>,
}

/// Decision for one request.
#[derive(Debug, PartialEq)]
pub enum RateLimitDecision {
    /// The request may proceed; `remaining` whole tokens are left.
    Allowed { remaining: u64 },

    /// The client is over its budget.
    Limited { retry_after: u64 },
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            capacity: config.burst,
            refill_rate: f64::from(config.requests_per_second),
            buckets: Mutex::new(HashMap::new()),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Consumes one token for `client_id`.
    pub fn check(&self, client_id: &str) -> RateLimitDecision {
        let decision = {
            let mut buckets = self.buckets.lock().unwrap();
            let bucket = buckets
                .entry(client_id.to_string())
                .or_insert_with(|| TokenBucket::new(self.capacity));

            if bucket.consume(self.capacity, self.refill_rate) {
                RateLimitDecision::Allowed {
                    remaining: bucket.tokens as u64,
                }
            } else {
                RateLimitDecision::Limited {
                    retry_after: bucket.retry_after(self.refill_rate),
                }
            }
        };

        self.maybe_cleanup();

        decision
    }

    fn maybe_cleanup(&self) {
        {
            let mut last_cleanup = self.last_cleanup.lock().unwrap();
            if last_cleanup.elapsed() < CLEANUP_INTERVAL {
                return;
            }
            *last_cleanup = Instant::now();
        }

        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.last_refill.elapsed() < IDLE_THRESHOLD);

        let evicted = before - buckets.len();
        if evicted > 0 {
            tracing::debug!("Evicted {evicted} idle rate-limit buckets");
        }
    }

    #[cfg(test)]
    fn force_cleanup(&self) {
        let mut buckets = self.buckets.lock().unwrap();
        buckets.retain(|_, bucket| bucket.last_refill.elapsed() < IDLE_THRESHOLD);
    }
}

/// Applies per-client rate limiting.
pub async fn apply_rate_limit<B>(
    Extension(state): Extension<State>,
    req: Request<B>,
    next: Next<B>,
) -> ServerResult<Response> {
    if EXEMPT_PATHS.contains(&req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let client_id = req
        .headers()
        .get("X-Owner-ID")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    match state.rate_limiter.check(&client_id) {
        RateLimitDecision::Allowed { remaining } => {
            let mut response = next.run(req).await;

            let headers = response.headers_mut();
            if let Ok(value) = state
                .config
                .rate_limit
                .requests_per_second
                .to_string()
                .parse()
            {
                headers.insert("X-RateLimit-Limit", value);
            }
            if let Ok(value) = remaining.to_string().parse() {
                headers.insert("X-RateLimit-Remaining", value);
            }

            Ok(response)
        }
        RateLimitDecision::Limited { retry_after } => {
            tracing::debug!(%client_id, "Rate limit exceeded");
            Err(ServerError::RateLimited { retry_after })
        }
    }
}
