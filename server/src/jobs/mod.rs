//! Background control loops.
//!
//! Three loops keep the pool consistent with the upstream provider:
//! sync (reconcile the pool), cleanup (destroy released sandboxes)
//! and expiry (reclaim orphaned allocations). Each runs once per
//! interval and exits at the next interval boundary on shutdown.

pub mod cleanup;
pub mod expiry;
pub mod sync;

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

use crate::State;

/// How long `stop` waits for the loops to finish their current tick.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Handle to the running background loops.
pub struct JobScheduler {
    tasks: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

/// Starts all background loops.
pub fn start(state: State) -> JobScheduler {
    let (shutdown, _) = watch::channel(false);

    let tasks = vec![
        tokio::spawn(sync_loop(state.clone(), shutdown.subscribe())),
        tokio::spawn(cleanup_loop(state.clone(), shutdown.subscribe())),
        tokio::spawn(expiry_loop(state, shutdown.subscribe())),
    ];

    tracing::info!("Started {} background loops", tasks.len());

    JobScheduler { tasks, shutdown }
}

impl JobScheduler {
    /// Requests shutdown and waits for the loops, bounded by the
    /// grace period.
    pub async fn stop(self) {
        tracing::info!("Stopping background loops...");
        let _ = self.shutdown.send(true);

        let join_all = async {
            for task in self.tasks {
                let _ = task.await;
            }
        };

        if time::timeout(SHUTDOWN_GRACE, join_all).await.is_err() {
            tracing::warn!("Background loops did not stop within the grace period");
        }
    }
}

async fn sync_loop(state: State, mut shutdown: watch::Receiver<bool>) {
    let interval = state.config.jobs.sync_interval;
    tracing::info!("Sync loop starting (interval: {:?})", interval);

    loop {
        if *shutdown.borrow() {
            break;
        }

        match sync::run_sync_once(&state).await {
            Ok(outcome) => tracing::info!(
                synced = outcome.synced,
                marked_stale = outcome.marked_stale,
                duration_ms = outcome.duration_ms,
                "Sync completed"
            ),
            Err(e) => tracing::warn!("Sync failed: {}", e),
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = time::sleep(interval) => {}
        }
    }
}

async fn cleanup_loop(state: State, mut shutdown: watch::Receiver<bool>) {
    let interval = state.config.jobs.cleanup_interval;
    tracing::info!("Cleanup loop starting (interval: {:?})", interval);

    loop {
        if *shutdown.borrow() {
            break;
        }

        match cleanup::run_cleanup_once(&state).await {
            Ok(outcome) => tracing::info!(
                deleted = outcome.deleted,
                failed = outcome.failed,
                aborted = outcome.aborted,
                duration_ms = outcome.duration_ms,
                "Cleanup completed"
            ),
            Err(e) => tracing::warn!("Cleanup failed: {}", e),
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = time::sleep(interval) => {}
        }
    }
}

async fn expiry_loop(state: State, mut shutdown: watch::Receiver<bool>) {
    let interval = state.config.jobs.expiry_interval;
    tracing::info!(
        "Expiry loop starting (interval: {:?}, threshold: {}s)",
        interval,
        state.config.expiry_threshold_seconds()
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        match expiry::run_expiry_once(&state).await {
            Ok(outcome) => tracing::info!(
                checked = outcome.checked,
                expired = outcome.expired,
                duration_ms = outcome.duration_ms,
                "Expiry sweep completed"
            ),
            Err(e) => tracing::warn!("Expiry sweep failed: {}", e),
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = time::sleep(interval) => {}
        }
    }
}
