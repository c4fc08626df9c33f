#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod access;
pub mod allocation;
mod api;
pub mod breaker;
pub mod config;
pub mod database;
mod error;
pub mod jobs;
mod metrics;
mod middleware;
mod ratelimit;
pub mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::http::{HeaderName, Method};
use axum::{extract::Extension, http::Uri, Router};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use tokio::sync::OnceCell;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use access::{apply_auth, AuthState};
use breaker::CircuitBreaker;
use config::{Config, UpstreamConfig};
use database::migration::{Migrator, MigratorTrait};
use error::{ServerError, ServerResult};
use metrics::Metrics;
use middleware::{init_request_state, security_headers};
use ratelimit::{apply_rate_limit, RateLimiter};
use upstream::{FixtureUpstream, HttpUpstream, UpstreamProvider};

pub type State = Arc<StateInner>;
type RequestState = Arc<RequestStateInner>;

/// Global server state.
#[derive(Debug)]
pub struct StateInner {
    /// The Broker Server configuration.
    pub config: Config,

    /// Handle to the database.
    database: OnceCell<DatabaseConnection>,

    /// Handle to the upstream provider.
    upstream: OnceCell<Arc<Box<dyn UpstreamProvider>>>,

    /// Circuit breaker guarding the upstream provider.
    ///
    /// One instance for the whole process; its state is the only
    /// mutable memory shared across requests and loops.
    pub breaker: CircuitBreaker,

    /// Metrics instruments.
    pub metrics: Metrics,

    /// Per-client rate-limit buckets.
    pub rate_limiter: RateLimiter,
}

/// Request state.
#[derive(Debug)]
struct RequestStateInner {
    /// Auth state.
    auth: AuthState,

    /// Unique ID of the request.
    request_id: String,
}

impl StateInner {
    pub async fn new(config: Config) -> State {
        let breaker = CircuitBreaker::new(&config.breaker);
        let rate_limiter = RateLimiter::new(&config.rate_limit);

        Arc::new(Self {
            config,
            database: OnceCell::new(),
            upstream: OnceCell::new(),
            breaker,
            metrics: Metrics::new(),
            rate_limiter,
        })
    }

    /// Returns a handle to the database.
    pub async fn database(&self) -> ServerResult<&DatabaseConnection> {
        self.database
            .get_or_try_init(|| async {
                let url = &self.config.database.url;
                let mut options = ConnectOptions::new(url.to_owned());

                // An in-memory SQLite database exists per connection;
                // pooling more than one would produce disjoint stores.
                if url.starts_with("sqlite::memory:") {
                    options.max_connections(1);
                }

                Database::connect(options)
                    .await
                    .map_err(ServerError::database_error)
            })
            .await
    }

    /// Returns a handle to the upstream provider.
    pub async fn upstream(&self) -> ServerResult<&Arc<Box<dyn UpstreamProvider>>> {
        self.upstream
            .get_or_try_init(|| async {
                match &self.config.upstream {
                    UpstreamConfig::Http(http_config) => {
                        let http = HttpUpstream::new(http_config.clone())?;
                        let boxed: Box<dyn UpstreamProvider> = Box::new(http);
                        Ok(Arc::new(boxed))
                    }
                    UpstreamConfig::Fixture(fixture_config) => {
                        let fixture = FixtureUpstream::new(fixture_config.clone());
                        let boxed: Box<dyn UpstreamProvider> = Box::new(fixture);
                        Ok(Arc::new(boxed))
                    }
                }
            })
            .await
    }

    #[cfg(test)]
    pub(crate) async fn set_upstream_for_test(&self, upstream: Arc<Box<dyn UpstreamProvider>>) {
        self.upstream
            .set(upstream)
            .expect("Upstream already initialized");
    }
}

/// The fallback route.
#[axum_macros::debug_handler]
async fn fallback(_: Uri) -> ServerResult<()> {
    Err(ServerError::NotFound)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            HeaderName::from_static("authorization"),
            HeaderName::from_static("content-type"),
            HeaderName::from_static("x-owner-id"),
            HeaderName::from_static("idempotency-key"),
            HeaderName::from_static("x-lab-tag"),
            HeaderName::from_static("x-name-prefix"),
        ])
        .expose_headers([
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-remaining"),
        ])
        .max_age(Duration::from_secs(3600))
}

/// Waits for the shutdown signal.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Could not listen for the shutdown signal: {}", e);
    }
}

/// Runs the API server.
///
/// With `run_background_jobs`, the three control loops run inside
/// this process as well (monolithic mode).
pub async fn run_api_server(
    cli_listen: Option<SocketAddr>,
    config: Config,
    run_background_jobs: bool,
) -> Result<()> {
    eprintln!("Starting API server...");

    let state = StateInner::new(config).await;

    let listen = if let Some(cli_listen) = cli_listen {
        cli_listen
    } else {
        state.config.listen.to_owned()
    };

    let rest = Router::new()
        .merge(api::get_router())
        .fallback(fallback)
        // middlewares
        .layer(axum::middleware::from_fn(apply_auth))
        .layer(axum::middleware::from_fn(apply_rate_limit))
        .layer(axum::middleware::from_fn(init_request_state))
        .layer(axum::middleware::from_fn(security_headers))
        .layer(Extension(state.clone()))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new());

    let scheduler = if run_background_jobs {
        Some(jobs::start(state.clone()))
    } else {
        None
    };

    eprintln!("Listening on {:?}...", listen);

    axum::Server::bind(&listen)
        .serve(rest.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight requests have completed; the loops exit at their next
    // interval boundary within the grace period.
    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }

    Ok(())
}

/// Runs the background loops without the API server.
///
/// For deployments running several API replicas, a single worker
/// process keeps the jobs from executing more than once per interval.
pub async fn run_worker(config: Config) -> Result<()> {
    eprintln!("Starting background worker...");

    let state = StateInner::new(config).await;
    let scheduler = jobs::start(state);

    shutdown_signal().await;
    scheduler.stop().await;

    Ok(())
}

/// Runs database migrations.
pub async fn run_migrations(config: Config) -> Result<()> {
    eprintln!("Running migrations...");

    let state = StateInner::new(config).await;
    let db = state.database().await?;
    Migrator::up(db, None).await?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A state over a fresh, migrated in-memory database with the
    /// fixture upstream.
    pub(crate) async fn test_state() -> State {
        test_state_with("").await
    }

    pub(crate) async fn test_state_with(config_toml: &str) -> State {
        let config: Config = toml::from_str(config_toml).expect("Could not parse test config");
        let state = StateInner::new(config).await;

        let db = state.database().await.expect("Could not open database");
        Migrator::up(db, None).await.expect("Could not run migrations");

        state
    }
}
