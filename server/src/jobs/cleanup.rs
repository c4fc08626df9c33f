//! Pending-deletion drain.

use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::time;
use tracing::instrument;

use crate::breaker::BreakerError;
use crate::database::entity::sandbox::SandboxStatus;
use crate::database::BrokerStore;
use crate::error::ServerResult;
use crate::State;

/// Summary of one cleanup run.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupOutcome {
    pub deleted: u64,
    pub failed: u64,

    /// Whether the run stopped early because the circuit opened.
    pub aborted: bool,

    pub duration_ms: u64,
}

/// Drains the pending-deletion queue in throttled batches.
///
/// Also retries `deletion_failed` records that have attempts left.
/// Upstream is only ever reached through the breaker; when the
/// circuit opens the rest of the tick is abandoned.
#[instrument(skip_all)]
pub async fn run_cleanup_once(state: &State) -> ServerResult<CleanupOutcome> {
    let started = Instant::now();
    let result = cleanup(state).await;

    match &result {
        Ok(_) => state
            .metrics
            .cleanup_runs
            .with_label_values(&["success"])
            .inc(),
        Err(_) => state
            .metrics
            .cleanup_runs
            .with_label_values(&["error"])
            .inc(),
    }
    state
        .metrics
        .cleanup_duration
        .observe(started.elapsed().as_secs_f64());

    result
}

async fn cleanup(state: &State) -> ServerResult<CleanupOutcome> {
    let started = Instant::now();
    let db = state.database().await?;
    let upstream = state.upstream().await?;
    let config = &state.config.jobs;

    let mut queue = db
        .query_by_status(SandboxStatus::PendingDeletion, None)
        .await?;

    let failed_retryable = db
        .query_by_status(SandboxStatus::DeletionFailed, None)
        .await?
        .into_iter()
        .filter(|sandbox| sandbox.deletion_retry_count < config.deletion_max_attempts);
    queue.extend(failed_retryable);

    let mut deleted = 0;
    let mut failed = 0;
    let mut aborted = false;

    let batches = queue.chunks(config.cleanup_batch_size.max(1));
    let batch_count = batches.len();

    'tick: for (index, batch) in batches.enumerate() {
        for sandbox in batch {
            let outcome = state
                .breaker
                .call(|| upstream.delete(&sandbox.external_id))
                .await;

            match outcome {
                Ok(_) => {
                    // `AlreadyAbsent` counts as success: upstream no
                    // longer knows the account either way.
                    db.delete_sandbox(&sandbox.sandbox_id).await?;
                    deleted += 1;
                    state.metrics.cleanup_deleted.inc();
                }
                Err(BreakerError::Open { retry_after }) => {
                    tracing::warn!(
                        retry_after,
                        "Upstream circuit open, abandoning cleanup tick"
                    );
                    aborted = true;
                    break 'tick;
                }
                Err(BreakerError::Inner(e)) => {
                    tracing::warn!(
                        sandbox_id = %sandbox.sandbox_id,
                        "Upstream deletion failed: {}",
                        e
                    );

                    let mut update = sandbox.clone();
                    update.status = SandboxStatus::DeletionFailed;
                    update.deletion_retry_count += 1;
                    db.put_sandbox(update, Utc::now().timestamp()).await?;
                    failed += 1;
                    state.metrics.cleanup_failed.inc();
                }
            }
        }

        if index + 1 < batch_count {
            time::sleep(config.cleanup_batch_delay).await;
        }
    }

    Ok(CleanupOutcome {
        deleted,
        failed,
        aborted,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}
