//! Upstream reconciliation.

use std::collections::HashSet;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::instrument;

use crate::breaker::BreakerError;
use crate::database::entity::sandbox::{SandboxModel, SandboxStatus};
use crate::database::BrokerStore;
use crate::error::{ServerError, ServerResult};
use crate::State;

/// Summary of one sync run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub synced: u64,
    pub marked_stale: u64,
    pub duration_ms: u64,
}

/// Reconciles the store against the upstream provider.
///
/// New upstream accounts are inserted as `available`; known
/// `available`/`stale` records are refreshed; records that are
/// allocated, pending deletion or deletion-failed are never touched.
/// Available records that disappeared upstream are marked `stale`.
#[instrument(skip_all)]
pub async fn run_sync_once(state: &State) -> ServerResult<SyncOutcome> {
    let started = Instant::now();
    let result = sync(state).await;

    match &result {
        Ok(outcome) => {
            state.metrics.sync_runs.with_label_values(&["success"]).inc();
            state.metrics.sync_synced.inc_by(outcome.synced);
            state.metrics.sync_stale.inc_by(outcome.marked_stale);
        }
        Err(_) => {
            state.metrics.sync_runs.with_label_values(&["error"]).inc();
        }
    }
    state
        .metrics
        .sync_duration
        .observe(started.elapsed().as_secs_f64());

    result
}

async fn sync(state: &State) -> ServerResult<SyncOutcome> {
    let started = Instant::now();
    let db = state.database().await?;
    let upstream = state.upstream().await?;

    let accounts = state
        .breaker
        .call(|| upstream.list_active())
        .await
        .map_err(|e| match e {
            BreakerError::Open { retry_after } => ServerError::CircuitOpen { retry_after },
            BreakerError::Inner(e) => e,
        })?;

    let now = Utc::now().timestamp();
    let mut synced = 0;
    let mut marked_stale = 0;

    let mut upstream_ids = HashSet::with_capacity(accounts.len());

    for account in accounts {
        upstream_ids.insert(account.id.clone());

        match db.get_sandbox(&account.id).await? {
            None => {
                let sandbox = SandboxModel {
                    sandbox_id: account.id,
                    name: account.name,
                    external_id: account.external_id,
                    status: SandboxStatus::Available,
                    allocated_to_owner: None,
                    allocated_at: 0,
                    lab_duration_hours: state.config.allocation.lab_duration_hours,
                    deletion_requested_at: None,
                    deletion_retry_count: 0,
                    last_synced: Some(now),
                    idempotency_key: None,
                    lab_tag: None,
                    created_at: account.created_at,
                    updated_at: now,
                };
                db.put_sandbox(sandbox, now).await?;
                synced += 1;
            }
            Some(existing)
                if matches!(
                    existing.status,
                    SandboxStatus::Available | SandboxStatus::Stale
                ) =>
            {
                let mut refreshed = existing;
                refreshed.name = account.name;
                refreshed.external_id = account.external_id;
                refreshed.status = SandboxStatus::Available;
                refreshed.last_synced = Some(now);
                db.put_sandbox(refreshed, now).await?;
                synced += 1;
            }
            // In-flight work must not be trampled by sync.
            Some(_) => {}
        }
    }

    let available = db.query_by_status(SandboxStatus::Available, None).await?;
    for sandbox in available {
        if !upstream_ids.contains(&sandbox.sandbox_id) {
            let mut stale = sandbox;
            stale.status = SandboxStatus::Stale;
            db.put_sandbox(stale, now).await?;
            marked_stale += 1;
        }
    }

    Ok(SyncOutcome {
        synced,
        marked_stale,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::database::tests::available_sandbox;
    use crate::test_support::test_state_with;

    const DRIFTED_POOL: &str = r#"
        [upstream]
        type = "fixture"
        accounts = [
            { id = "sbx-a" },
            { id = "sbx-d" },
        ]
    "#;

    #[tokio::test]
    async fn test_sync_with_drift() {
        let state = test_state_with(DRIFTED_POOL).await;
        let db = state.database().await.unwrap();

        db.put_sandbox(available_sandbox("sbx-a"), 100).await.unwrap();

        let mut allocated = available_sandbox("sbx-b");
        allocated.status = SandboxStatus::Allocated;
        allocated.allocated_to_owner = Some("owner-x".to_string());
        allocated.allocated_at = 100;
        allocated.idempotency_key = Some("owner-x".to_string());
        db.put_sandbox(allocated, 100).await.unwrap();

        db.put_sandbox(available_sandbox("sbx-c"), 100).await.unwrap();

        let outcome = run_sync_once(&state).await.unwrap();
        assert_eq!(2, outcome.synced); // sbx-a refreshed, sbx-d inserted
        assert_eq!(1, outcome.marked_stale); // sbx-c

        let a = db.get_sandbox("sbx-a").await.unwrap().unwrap();
        assert_eq!(SandboxStatus::Available, a.status);
        assert!(a.last_synced.is_some());

        // The in-flight allocation is untouched.
        let b = db.get_sandbox("sbx-b").await.unwrap().unwrap();
        assert_eq!(SandboxStatus::Allocated, b.status);
        assert_eq!(Some("owner-x".to_string()), b.allocated_to_owner);

        let c = db.get_sandbox("sbx-c").await.unwrap().unwrap();
        assert_eq!(SandboxStatus::Stale, c.status);

        let d = db.get_sandbox("sbx-d").await.unwrap().unwrap();
        assert_eq!(SandboxStatus::Available, d.status);
        assert_eq!(0, d.allocated_at);
    }

    #[tokio::test]
    async fn test_sync_recovers_stale_records() {
        let state = test_state_with(DRIFTED_POOL).await;
        let db = state.database().await.unwrap();

        let mut stale = available_sandbox("sbx-a");
        stale.status = SandboxStatus::Stale;
        db.put_sandbox(stale, 100).await.unwrap();

        run_sync_once(&state).await.unwrap();

        let a = db.get_sandbox("sbx-a").await.unwrap().unwrap();
        assert_eq!(SandboxStatus::Available, a.status);
    }

    #[tokio::test]
    async fn test_sync_never_touches_pending_deletion() {
        let state = test_state_with(DRIFTED_POOL).await;
        let db = state.database().await.unwrap();

        let mut pending = available_sandbox("sbx-a");
        pending.status = SandboxStatus::PendingDeletion;
        pending.deletion_requested_at = Some(150);
        db.put_sandbox(pending, 150).await.unwrap();

        run_sync_once(&state).await.unwrap();

        let a = db.get_sandbox("sbx-a").await.unwrap().unwrap();
        assert_eq!(SandboxStatus::PendingDeletion, a.status);
    }
}
