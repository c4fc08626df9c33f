//! Prometheus metrics.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use sea_orm::DatabaseConnection;

use crate::database::BrokerStore;
use crate::error::{ServerError, ServerResult};

/// How long a pool gauge computation stays fresh.
///
/// Pool gauges require a full enumeration of the store; the cache
/// keeps scrape storms from turning into scan storms.
const POOL_GAUGE_TTL: Duration = Duration::from_secs(60);

/// All instruments, registered against one registry.
#[derive(Debug)]
pub struct Metrics {
    registry: Registry,
    pool_gauge_refreshed: Mutex<Option<Instant>>,

    pub pool_sandboxes: IntGaugeVec,

    pub allocate_total: IntCounterVec,
    pub allocate_idempotent_hits: IntCounter,
    pub allocate_conflicts: IntCounter,
    pub allocation_duration: HistogramVec,

    pub release_total: IntCounterVec,

    pub sync_runs: IntCounterVec,
    pub sync_synced: IntCounter,
    pub sync_stale: IntCounter,
    pub sync_duration: Histogram,

    pub cleanup_runs: IntCounterVec,
    pub cleanup_deleted: IntCounter,
    pub cleanup_failed: IntCounter,
    pub cleanup_duration: Histogram,

    pub expiry_runs: IntCounterVec,
    pub expiry_orphaned: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let pool_sandboxes = IntGaugeVec::new(
            Opts::new("broker_pool_sandboxes", "Sandbox pool size by status"),
            &["status"],
        )
        .unwrap();

        let allocate_total = IntCounterVec::new(
            Opts::new("broker_allocate_total", "Allocation requests by outcome"),
            &["outcome"],
        )
        .unwrap();
        let allocate_idempotent_hits = IntCounter::new(
            "broker_allocate_idempotent_hits_total",
            "Allocations satisfied by an existing allocation",
        )
        .unwrap();
        let allocate_conflicts = IntCounter::new(
            "broker_allocate_conflicts_total",
            "Conditional-write conflicts during candidate walks",
        )
        .unwrap();
        let allocation_duration = HistogramVec::new(
            HistogramOpts::new(
                "broker_allocation_duration_seconds",
                "Allocation latency by outcome",
            ),
            &["outcome"],
        )
        .unwrap();

        let release_total = IntCounterVec::new(
            Opts::new("broker_release_total", "Release requests by outcome"),
            &["outcome"],
        )
        .unwrap();

        let sync_runs = IntCounterVec::new(
            Opts::new("broker_sync_runs_total", "Sync runs by outcome"),
            &["outcome"],
        )
        .unwrap();
        let sync_synced = IntCounter::new(
            "broker_sync_sandboxes_synced_total",
            "Sandboxes upserted by the sync loop",
        )
        .unwrap();
        let sync_stale = IntCounter::new(
            "broker_sync_sandboxes_stale_total",
            "Sandboxes marked stale by the sync loop",
        )
        .unwrap();
        let sync_duration = Histogram::with_opts(HistogramOpts::new(
            "broker_sync_duration_seconds",
            "Duration of sync runs",
        ))
        .unwrap();

        let cleanup_runs = IntCounterVec::new(
            Opts::new("broker_cleanup_runs_total", "Cleanup runs by outcome"),
            &["outcome"],
        )
        .unwrap();
        let cleanup_deleted = IntCounter::new(
            "broker_cleanup_deleted_total",
            "Sandboxes destroyed upstream and removed from the pool",
        )
        .unwrap();
        let cleanup_failed = IntCounter::new(
            "broker_cleanup_failed_total",
            "Upstream deletions that failed",
        )
        .unwrap();
        let cleanup_duration = Histogram::with_opts(HistogramOpts::new(
            "broker_cleanup_duration_seconds",
            "Duration of cleanup runs",
        ))
        .unwrap();

        let expiry_runs = IntCounterVec::new(
            Opts::new("broker_expiry_runs_total", "Expiry sweeps by outcome"),
            &["outcome"],
        )
        .unwrap();
        let expiry_orphaned = IntCounter::new(
            "broker_expiry_orphaned_total",
            "Orphaned allocations reclaimed by the expiry loop",
        )
        .unwrap();

        for collector in [
            Box::new(pool_sandboxes.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(allocate_total.clone()),
            Box::new(allocate_idempotent_hits.clone()),
            Box::new(allocate_conflicts.clone()),
            Box::new(allocation_duration.clone()),
            Box::new(release_total.clone()),
            Box::new(sync_runs.clone()),
            Box::new(sync_synced.clone()),
            Box::new(sync_stale.clone()),
            Box::new(sync_duration.clone()),
            Box::new(cleanup_runs.clone()),
            Box::new(cleanup_deleted.clone()),
            Box::new(cleanup_failed.clone()),
            Box::new(cleanup_duration.clone()),
            Box::new(expiry_runs.clone()),
            Box::new(expiry_orphaned.clone()),
        ] {
            registry.register(collector).unwrap();
        }

        Self {
            registry,
            pool_gauge_refreshed: Mutex::new(None),
            pool_sandboxes,
            allocate_total,
            allocate_idempotent_hits,
            allocate_conflicts,
            allocation_duration,
            release_total,
            sync_runs,
            sync_synced,
            sync_stale,
            sync_duration,
            cleanup_runs,
            cleanup_deleted,
            cleanup_failed,
            cleanup_duration,
            expiry_runs,
            expiry_orphaned,
        }
    }

    /// Recomputes the pool gauges unless a fresh computation exists.
    pub async fn update_pool_gauges(&self, db: &DatabaseConnection) -> ServerResult<()> {
        {
            let refreshed = self.pool_gauge_refreshed.lock().unwrap();
            if let Some(refreshed) = *refreshed {
                if refreshed.elapsed() < POOL_GAUGE_TTL {
                    return Ok(());
                }
            }
        }

        let stats = db.status_counts().await?;

        self.pool_sandboxes
            .with_label_values(&["total"])
            .set(stats.total as i64);
        self.pool_sandboxes
            .with_label_values(&["available"])
            .set(stats.available as i64);
        self.pool_sandboxes
            .with_label_values(&["allocated"])
            .set(stats.allocated as i64);
        self.pool_sandboxes
            .with_label_values(&["pending_deletion"])
            .set(stats.pending_deletion as i64);
        self.pool_sandboxes
            .with_label_values(&["stale"])
            .set(stats.stale as i64);
        self.pool_sandboxes
            .with_label_values(&["deletion_failed"])
            .set(stats.deletion_failed as i64);

        *self.pool_gauge_refreshed.lock().unwrap() = Some(Instant::now());

        Ok(())
    }

    /// Renders the registry in the Prometheus exposition format.
    pub fn render(&self) -> ServerResult<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();

        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| ServerError::RequestError(anyhow::Error::new(e)))?;

        String::from_utf8(buffer).map_err(ServerError::request_error)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::database::entity::sandbox::SandboxStatus;
    use crate::database::tests::{available_sandbox, setup_db};

    #[tokio::test]
    async fn test_pool_gauges_and_render() {
        let db = setup_db().await;
        db.put_sandbox(available_sandbox("sbx-1"), 100).await.unwrap();
        let mut allocated = available_sandbox("sbx-2");
        allocated.status = SandboxStatus::Allocated;
        allocated.allocated_to_owner = Some("owner-a".to_string());
        allocated.allocated_at = 100;
        db.put_sandbox(allocated, 100).await.unwrap();

        let metrics = Metrics::new();
        metrics.update_pool_gauges(&db).await.unwrap();

        assert_eq!(2, metrics.pool_sandboxes.with_label_values(&["total"]).get());
        assert_eq!(
            1,
            metrics
                .pool_sandboxes
                .with_label_values(&["available"])
                .get()
        );

        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("broker_pool_sandboxes"));
    }

    #[tokio::test]
    async fn test_pool_gauges_are_cached() {
        let db = setup_db().await;
        db.put_sandbox(available_sandbox("sbx-1"), 100).await.unwrap();

        let metrics = Metrics::new();
        metrics.update_pool_gauges(&db).await.unwrap();
        assert_eq!(1, metrics.pool_sandboxes.with_label_values(&["total"]).get());

        // New records do not show up until the cache expires.
        db.put_sandbox(available_sandbox("sbx-2"), 200).await.unwrap();
        metrics.update_pool_gauges(&db).await.unwrap();
        assert_eq!(1, metrics.pool_sandboxes.with_label_values(&["total"]).get());
    }
}
