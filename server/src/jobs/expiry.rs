//! Orphaned-allocation sweep.
//!
//! The safety net for clients that crash without releasing: any
//! allocation past its grace-extended deadline is claimed for
//! deletion.

use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::instrument;

use crate::database::entity::sandbox::SandboxStatus;
use crate::database::BrokerStore;
use crate::error::ServerResult;
use crate::State;

/// Summary of one expiry sweep.
#[derive(Debug, Clone, Serialize)]
pub struct ExpiryOutcome {
    pub checked: u64,
    pub expired: u64,
    pub duration_ms: u64,
}

#[instrument(skip_all)]
pub async fn run_expiry_once(state: &State) -> ServerResult<ExpiryOutcome> {
    let started = Instant::now();
    let result = expire(state).await;

    match &result {
        Ok(outcome) => {
            state
                .metrics
                .expiry_runs
                .with_label_values(&["success"])
                .inc();
            state.metrics.expiry_orphaned.inc_by(outcome.expired);
        }
        Err(_) => {
            state.metrics.expiry_runs.with_label_values(&["error"]).inc();
        }
    }

    result
}

async fn expire(state: &State) -> ServerResult<ExpiryOutcome> {
    let started = Instant::now();
    let db = state.database().await?;
    let grace = state.config.allocation.grace_period;
    let now = Utc::now().timestamp();

    let allocated = db.query_by_status(SandboxStatus::Allocated, None).await?;
    let checked = allocated.len() as u64;
    let mut expired = 0;

    for sandbox in allocated {
        if sandbox.allocated_at > 0 && sandbox.is_expired(now, grace) {
            tracing::info!(
                sandbox_id = %sandbox.sandbox_id,
                allocated_at = sandbox.allocated_at,
                "Expiring orphaned allocation"
            );

            // Unconditional: the loop owns this transition, and a race
            // with the releaser converges on the same state.
            let mut orphaned = sandbox;
            orphaned.status = SandboxStatus::PendingDeletion;
            orphaned.deletion_requested_at = Some(now);
            db.put_sandbox(orphaned, now).await?;
            expired += 1;
        }
    }

    Ok(ExpiryOutcome {
        checked,
        expired,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::database::tests::available_sandbox;
    use crate::test_support::test_state;

    #[tokio::test]
    async fn test_expiry_reclaims_orphans() {
        let state = test_state().await;
        let db = state.database().await.unwrap();
        let now = Utc::now().timestamp();

        let mut orphaned = available_sandbox("sbx-old");
        orphaned.status = SandboxStatus::Allocated;
        orphaned.allocated_to_owner = Some("owner-gone".to_string());
        orphaned.allocated_at = now - state.config.expiry_threshold_seconds() - 10;
        db.put_sandbox(orphaned, now).await.unwrap();

        let mut live = available_sandbox("sbx-live");
        live.status = SandboxStatus::Allocated;
        live.allocated_to_owner = Some("owner-here".to_string());
        live.allocated_at = now - 60;
        db.put_sandbox(live, now).await.unwrap();

        let outcome = run_expiry_once(&state).await.unwrap();
        assert_eq!(2, outcome.checked);
        assert_eq!(1, outcome.expired);

        let old = db.get_sandbox("sbx-old").await.unwrap().unwrap();
        assert_eq!(SandboxStatus::PendingDeletion, old.status);
        assert!(old.deletion_requested_at.is_some());

        let fresh = db.get_sandbox("sbx-live").await.unwrap().unwrap();
        assert_eq!(SandboxStatus::Allocated, fresh.status);
    }

    #[tokio::test]
    async fn test_expiry_honors_per_sandbox_duration() {
        let state = test_state().await;
        let db = state.database().await.unwrap();
        let now = Utc::now().timestamp();

        // Allocated 5 hours ago with an 8 hour horizon: not orphaned.
        let mut long_lab = available_sandbox("sbx-long");
        long_lab.status = SandboxStatus::Allocated;
        long_lab.allocated_to_owner = Some("owner-a".to_string());
        long_lab.lab_duration_hours = 8;
        long_lab.allocated_at = now - 5 * 3600;
        db.put_sandbox(long_lab, now).await.unwrap();

        let outcome = run_expiry_once(&state).await.unwrap();
        assert_eq!(0, outcome.expired);
    }
}
