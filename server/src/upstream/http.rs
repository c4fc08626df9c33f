//! HTTP adapter for the cloud provider's account API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{DeleteOutcome, UpstreamAccount, UpstreamProvider};
use crate::error::{ServerError, ServerResult};

/// HTTP upstream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpUpstreamConfig {
    /// Base URL of the provider API.
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// API token.
    pub token: String,

    /// Connection timeout.
    #[serde(rename = "connect-timeout")]
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Read timeout. Deletions are slow upstream.
    #[serde(rename = "read-timeout")]
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(15)
}

/// The HTTP upstream adapter.
#[derive(Debug)]
pub struct HttpUpstream {
    client: Client,
    config: HttpUpstreamConfig,
}

#[derive(Debug, Deserialize)]
struct AccountListing {
    #[serde(default)]
    results: Vec<RawAccount>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    id: String,

    #[serde(default)]
    name: Option<String>,

    #[serde(default)]
    account_type: Option<String>,

    #[serde(default)]
    state: Option<String>,

    #[serde(default)]
    csp_id: Option<i64>,

    #[serde(default)]
    created_at: Option<String>,
}

impl HttpUpstream {
    pub fn new(config: HttpUpstreamConfig) -> ServerResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .map_err(ServerError::upstream_error)?;

        Ok(Self { client, config })
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.config.token)
    }
}

#[async_trait]
impl UpstreamProvider for HttpUpstream {
    async fn list_active(&self) -> ServerResult<Vec<UpstreamAccount>> {
        let url = format!("{}/current_user/accounts", self.config.base_url);

        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(ServerError::upstream_error)?
            .error_for_status()
            .map_err(ServerError::upstream_error)?;

        let listing: AccountListing = response
            .json()
            .await
            .map_err(ServerError::upstream_error)?;

        let now = Utc::now().timestamp();
        let accounts = listing
            .results
            .into_iter()
            .filter(|account| {
                account.account_type.as_deref() == Some("sandbox")
                    && account.state.as_deref() == Some("active")
            })
            .map(|account| {
                let id = account
                    .csp_id
                    .map(|csp_id| csp_id.to_string())
                    .unwrap_or_else(|| account.id.clone());

                UpstreamAccount {
                    name: account.name.unwrap_or_else(|| format!("sandbox-{id}")),
                    external_id: account.id,
                    created_at: parse_timestamp(account.created_at.as_deref(), now),
                    id,
                }
            })
            .collect::<Vec<_>>();

        tracing::debug!("Upstream listed {} active sandbox accounts", accounts.len());

        Ok(accounts)
    }

    async fn delete(&self, external_id: &str) -> ServerResult<DeleteOutcome> {
        // The listing returns identity paths ("identity/accounts/{uuid}");
        // the deletion endpoint is addressed by the bare tail segment.
        let handle = external_id.rsplit('/').next().unwrap_or(external_id);
        let url = format!("{}/sandbox/accounts/{}", self.config.base_url, handle);

        let response = self
            .client
            .delete(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(ServerError::upstream_error)?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(DeleteOutcome::Deleted),
            StatusCode::NOT_FOUND => Ok(DeleteOutcome::AlreadyAbsent),
            status => Err(ServerError::UpstreamError(anyhow::anyhow!(
                "Upstream deletion of {external_id} returned {status}"
            ))),
        }
    }
}

fn parse_timestamp(timestamp: Option<&str>, fallback: i64) -> i64 {
    timestamp
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc).timestamp())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(
            1743094427,
            parse_timestamp(Some("2025-03-27T16:53:47.605459Z"), 0)
        );
        assert_eq!(42, parse_timestamp(None, 42));
        assert_eq!(42, parse_timestamp(Some("not-a-timestamp"), 42));
    }
}
