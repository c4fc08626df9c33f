//! Fixture upstream for development and tests.
//!
//! Serves a fixed account list from the configuration and accepts
//! every deletion.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use super::{DeleteOutcome, UpstreamAccount, UpstreamProvider};
use crate::error::ServerResult;

/// Fixture upstream configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FixtureUpstreamConfig {
    /// The accounts the provider reports as active.
    #[serde(default)]
    pub accounts: Vec<FixtureAccount>,
}

/// One fixture account.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureAccount {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(rename = "external-id")]
    #[serde(default)]
    pub external_id: Option<String>,
}

/// The fixture upstream adapter.
#[derive(Debug)]
pub struct FixtureUpstream {
    config: FixtureUpstreamConfig,
}

impl FixtureUpstream {
    pub fn new(config: FixtureUpstreamConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl UpstreamProvider for FixtureUpstream {
    async fn list_active(&self) -> ServerResult<Vec<UpstreamAccount>> {
        let now = Utc::now().timestamp();

        Ok(self
            .config
            .accounts
            .iter()
            .map(|account| UpstreamAccount {
                id: account.id.clone(),
                name: account
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("sandbox-{}", account.id)),
                external_id: account
                    .external_id
                    .clone()
                    .unwrap_or_else(|| format!("fixture/accounts/{}", account.id)),
                created_at: now,
            })
            .collect())
    }

    async fn delete(&self, external_id: &str) -> ServerResult<DeleteOutcome> {
        tracing::debug!("Fixture upstream deleting {external_id}");
        Ok(DeleteOutcome::Deleted)
    }
}
