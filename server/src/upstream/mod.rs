//! Upstream cloud provider.
//!
//! The pool is externally populated: the broker never creates
//! sandboxes upstream, it only lists active accounts and destroys
//! released ones.

mod fixture;
mod http;

use async_trait::async_trait;

use crate::error::ServerResult;

pub(crate) use self::fixture::FixtureUpstream;
pub(crate) use self::http::HttpUpstream;
pub use self::fixture::FixtureUpstreamConfig;
pub use self::http::HttpUpstreamConfig;

/// An active sandbox account as reported by the upstream provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAccount {
    /// Stable ID used as the broker-side `sandbox_id`.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Opaque handle used to address the account upstream.
    pub external_id: String,

    /// Creation timestamp, seconds since epoch.
    pub created_at: i64,
}

/// Result of an upstream deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The account was destroyed.
    Deleted,

    /// Upstream no longer knows the account. Treated as success
    /// by the cleanup loop.
    AlreadyAbsent,
}

/// An upstream provider.
#[async_trait]
pub trait UpstreamProvider: Send + Sync + std::fmt::Debug {
    /// Lists all active sandbox accounts.
    async fn list_active(&self) -> ServerResult<Vec<UpstreamAccount>>;

    /// Deletes an account by its opaque external handle.
    ///
    /// Transient failures surface as errors; the cleanup loop turns
    /// them into `deletion_failed` records rather than failing the tick.
    async fn delete(&self, external_id: &str) -> ServerResult<DeleteOutcome>;
}
