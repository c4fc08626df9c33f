//! Sandbox allocation and release.
//!
//! The allocator never locks anything: correctness rests entirely on
//! the store's conditional writes. Everything here is expected
//! control flow under contention.

use std::time::{Duration, Instant};

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time;

use crate::database::entity::sandbox::{SandboxModel, SandboxStatus};
use crate::database::BrokerStore;
use crate::error::{ServerError, ServerResult};
use crate::State;

/// An allocation request.
#[derive(Debug, Clone, Default)]
pub struct AllocateRequest {
    /// The client instance requesting a sandbox.
    pub owner: String,

    /// Deduplication token; defaults to the owner itself.
    pub idempotency_key: Option<String>,

    /// Opaque grouping tag recorded on the allocation.
    pub lab_tag: Option<String>,

    /// Restricts candidates to sandboxes whose name carries this prefix.
    pub name_prefix: Option<String>,
}

/// A successful allocation.
#[derive(Debug)]
pub struct AllocateOutcome {
    pub sandbox: SandboxModel,

    /// Whether an existing live allocation was returned instead of a
    /// fresh claim.
    pub idempotent: bool,
}

/// Allocates a sandbox to `request.owner`.
pub async fn allocate(state: &State, request: AllocateRequest) -> ServerResult<AllocateOutcome> {
    let started = Instant::now();
    let result = try_allocate(state, &request).await;

    let outcome_label = match &result {
        Ok(outcome) if outcome.idempotent => "idempotent",
        Ok(_) => "success",
        Err(ServerError::NoSandboxesAvailable { .. }) => "no_sandboxes",
        Err(_) => "error",
    };
    state
        .metrics
        .allocate_total
        .with_label_values(&[outcome_label])
        .inc();
    state
        .metrics
        .allocation_duration
        .with_label_values(&[outcome_label])
        .observe(started.elapsed().as_secs_f64());

    result
}

async fn try_allocate(state: &State, request: &AllocateRequest) -> ServerResult<AllocateOutcome> {
    let db = state.database().await?;
    let config = &state.config;
    let now = Utc::now().timestamp();

    let idem_key = request
        .idempotency_key
        .as_deref()
        .unwrap_or(&request.owner);

    // A retrying client that already holds a live allocation must not
    // be issued a second one.
    if let Some(existing) = db.find_allocation_by_idempotency_key(idem_key).await? {
        if existing.status == SandboxStatus::Allocated
            && !existing.is_expired(now, config.allocation.grace_period)
        {
            state.metrics.allocate_idempotent_hits.inc();
            return Ok(AllocateOutcome {
                sandbox: existing,
                idempotent: true,
            });
        }
    }

    let mut candidates = db
        .query_by_status(SandboxStatus::Available, Some(config.allocation.k_candidates))
        .await?;

    if let Some(prefix) = request.name_prefix.as_deref() {
        candidates.retain(|candidate| candidate.name.starts_with(prefix));
    }

    if candidates.is_empty() {
        return Err(ServerError::NoSandboxesAvailable {
            retry_after: config.allocation.retry_after,
        });
    }

    // N concurrent callers reading the same ordered K-list would all
    // fight over candidate 0 first. Shuffling drops the expected
    // collisions per success to roughly N/K.
    {
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
    }

    let max_attempts = candidates.len();
    let mut conflicts: u64 = 0;

    for (attempt, candidate) in candidates.iter().enumerate() {
        let allocated = db
            .conditional_allocate(
                &candidate.sandbox_id,
                &request.owner,
                idem_key,
                now,
                request.lab_tag.as_deref(),
            )
            .await?;

        if let Some(sandbox) = allocated {
            if conflicts > 0 {
                state.metrics.allocate_conflicts.inc_by(conflicts);
            }
            return Ok(AllocateOutcome {
                sandbox,
                idempotent: false,
            });
        }

        // Another caller won this candidate.
        conflicts += 1;

        if attempt < max_attempts - 1 {
            let backoff = jittered_backoff(
                attempt as u32,
                config.allocation.backoff_base_ms,
                config.allocation.backoff_max_ms,
            );
            time::sleep(backoff).await;
        }
    }

    state.metrics.allocate_conflicts.inc_by(conflicts);

    tracing::debug!(
        owner = %request.owner,
        attempts = max_attempts,
        "Allocation exhausted all candidates"
    );

    Err(ServerError::NoSandboxesAvailable {
        retry_after: config.allocation.retry_after,
    })
}

/// Marks a sandbox for deletion, with ownership and expiry checks.
pub async fn mark_for_deletion(
    state: &State,
    sandbox_id: &str,
    owner: &str,
) -> ServerResult<SandboxModel> {
    let db = state.database().await?;
    let now = Utc::now().timestamp();

    // The deadline honors a per-sandbox duration override, so the
    // record must be read first; the Releaser and the expiry loop
    // have to agree on when an allocation is due. The conditional
    // write below still arbitrates any race with that read.
    let existing = match db.get_sandbox(sandbox_id).await? {
        Some(existing) => existing,
        None => {
            state
                .metrics
                .release_total
                .with_label_values(&["not_found"])
                .inc();
            return Err(ServerError::NotOwner);
        }
    };

    // allocated_at must be strictly newer than this for the client
    // transition to be honored; past it, the expiry loop owns the record.
    let min_valid_allocated_at = now - i64::from(existing.lab_duration_hours) * 3600;

    let marked = db
        .conditional_mark_for_deletion(sandbox_id, owner, now, min_valid_allocated_at)
        .await;

    let (outcome_label, result) = match marked {
        Ok(Some(sandbox)) => ("success", Ok(sandbox)),
        Ok(None) => {
            // The conditional write failed; one diagnostic read tells
            // the caller why. Races here are benign.
            match db.get_sandbox(sandbox_id).await? {
                None => ("not_found", Err(ServerError::NotOwner)),
                Some(existing) if existing.status != SandboxStatus::Allocated => {
                    ("not_allocated", Err(ServerError::NotOwner))
                }
                Some(existing) if existing.allocated_to_owner.as_deref() != Some(owner) => {
                    ("not_owner", Err(ServerError::NotOwner))
                }
                Some(_) => ("expired", Err(ServerError::AllocationExpired)),
            }
        }
        Err(e) => ("error", Err(e)),
    };

    state
        .metrics
        .release_total
        .with_label_values(&[outcome_label])
        .inc();

    result
}

/// Retrieves a sandbox on behalf of its owner.
pub async fn get_owned(state: &State, sandbox_id: &str, owner: &str) -> ServerResult<SandboxModel> {
    let db = state.database().await?;

    let sandbox = db
        .get_sandbox(sandbox_id)
        .await?
        .ok_or(ServerError::NotOwner)?;

    if !sandbox.is_owned_by(owner) {
        return Err(ServerError::NotOwner);
    }

    Ok(sandbox)
}

fn jittered_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let cap = 2u64
        .saturating_pow(attempt)
        .saturating_mul(base_ms)
        .min(max_ms);

    let jitter = {
        let mut rng = rand::thread_rng();
        rng.gen_range(0.0..=cap as f64)
    };

    Duration::from_millis(jitter as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::task::JoinSet;

    use crate::database::tests::available_sandbox;
    use crate::test_support::test_state;

    fn request(owner: &str) -> AllocateRequest {
        AllocateRequest {
            owner: owner.to_string(),
            ..Default::default()
        }
    }

    async fn seed_pool(state: &State, ids: &[&str]) {
        let db = state.database().await.unwrap();
        for id in ids {
            db.put_sandbox(available_sandbox(id), 100).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_idempotent_retry() {
        let state = test_state().await;
        seed_pool(&state, &["sbx-a", "sbx-b"]).await;

        let first = allocate(&state, request("owner-x")).await.unwrap();
        assert!(!first.idempotent);

        let second = allocate(&state, request("owner-x")).await.unwrap();
        assert!(second.idempotent);
        assert_eq!(first.sandbox.sandbox_id, second.sandbox.sandbox_id);

        // The pool still has one free sandbox.
        let db = state.database().await.unwrap();
        let available = db
            .query_by_status(SandboxStatus::Available, None)
            .await
            .unwrap();
        assert_eq!(1, available.len());
    }

    #[tokio::test]
    async fn test_hot_contention() {
        let state = test_state().await;
        seed_pool(&state, &["sbx-1", "sbx-2", "sbx-3"]).await;

        let mut tasks = JoinSet::new();
        for i in 0..10 {
            let state = state.clone();
            tasks.spawn(async move { allocate(&state, request(&format!("owner-{i}"))).await });
        }

        let mut winners = Vec::new();
        let mut exhausted = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap() {
                Ok(outcome) => winners.push(outcome.sandbox.sandbox_id),
                Err(ServerError::NoSandboxesAvailable { .. }) => exhausted += 1,
                Err(e) => panic!("Unexpected error: {e:?}"),
            }
        }

        winners.sort();
        winners.dedup();
        assert_eq!(3, winners.len());
        assert_eq!(7, exhausted);
    }

    #[tokio::test]
    async fn test_empty_pool() {
        let state = test_state().await;

        match allocate(&state, request("owner-x")).await {
            Err(ServerError::NoSandboxesAvailable { retry_after }) => {
                assert_eq!(30, retry_after);
            }
            other => panic!("Expected pool exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_name_prefix_filter() {
        let state = test_state().await;
        let db = state.database().await.unwrap();

        let mut adventure = available_sandbox("sbx-1");
        adventure.name = "lab-adventure-01".to_string();
        db.put_sandbox(adventure, 100).await.unwrap();

        let mut intro = available_sandbox("sbx-2");
        intro.name = "lab-intro-01".to_string();
        db.put_sandbox(intro, 100).await.unwrap();

        let outcome = allocate(
            &state,
            AllocateRequest {
                owner: "owner-x".to_string(),
                name_prefix: Some("lab-intro".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!("sbx-2", outcome.sandbox.sandbox_id);
    }

    #[tokio::test]
    async fn test_expired_allocation_is_not_reissued() {
        let state = test_state().await;
        seed_pool(&state, &["sbx-1", "sbx-2"]).await;
        let db = state.database().await.unwrap();

        let first = allocate(&state, request("owner-x")).await.unwrap();

        // Backdate the allocation past the grace-extended deadline.
        let mut expired = first.sandbox.clone();
        expired.allocated_at = Utc::now().timestamp() - state.config.expiry_threshold_seconds() - 10;
        db.put_sandbox(expired, Utc::now().timestamp()).await.unwrap();

        let second = allocate(&state, request("owner-x")).await.unwrap();
        assert!(!second.idempotent);
        assert_ne!(first.sandbox.sandbox_id, second.sandbox.sandbox_id);
    }

    #[tokio::test]
    async fn test_release() {
        let state = test_state().await;
        seed_pool(&state, &["sbx-1"]).await;

        let allocated = allocate(&state, request("owner-x")).await.unwrap();
        let released = mark_for_deletion(&state, &allocated.sandbox.sandbox_id, "owner-x")
            .await
            .unwrap();
        assert_eq!(SandboxStatus::PendingDeletion, released.status);
        assert!(released.deletion_requested_at.is_some());

        // A second release sees a record that is no longer allocated.
        match mark_for_deletion(&state, &allocated.sandbox.sandbox_id, "owner-x").await {
            Err(ServerError::NotOwner) => {}
            other => panic!("Expected NotOwner, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_release_wrong_owner() {
        let state = test_state().await;
        seed_pool(&state, &["sbx-1"]).await;

        let allocated = allocate(&state, request("owner-a")).await.unwrap();

        match mark_for_deletion(&state, &allocated.sandbox.sandbox_id, "owner-b").await {
            Err(ServerError::NotOwner) => {}
            other => panic!("Expected NotOwner, got {other:?}"),
        }

        // The record is untouched.
        let db = state.database().await.unwrap();
        let record = db
            .get_sandbox(&allocated.sandbox.sandbox_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(SandboxStatus::Allocated, record.status);
        assert_eq!(Some("owner-a".to_string()), record.allocated_to_owner);
    }

    #[tokio::test]
    async fn test_release_after_expiry() {
        let state = test_state().await;
        seed_pool(&state, &["sbx-1"]).await;
        let db = state.database().await.unwrap();

        let allocated = allocate(&state, request("owner-a")).await.unwrap();

        // Backdate the allocation past the lab duration.
        let mut sandbox = allocated.sandbox.clone();
        sandbox.allocated_at = Utc::now().timestamp() - state.config.lab_duration_seconds() - 10;
        db.put_sandbox(sandbox, Utc::now().timestamp()).await.unwrap();

        match mark_for_deletion(&state, &allocated.sandbox.sandbox_id, "owner-a").await {
            Err(ServerError::AllocationExpired) => {}
            other => panic!("Expected AllocationExpired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_release_honors_per_sandbox_duration() {
        let state = test_state().await;
        seed_pool(&state, &["sbx-1"]).await;
        let db = state.database().await.unwrap();

        let allocated = allocate(&state, request("owner-a")).await.unwrap();

        // An 8 hour horizon released 5 hours in: past the fleet-wide
        // 4 hour default, but well within the record's own deadline.
        let mut sandbox = allocated.sandbox.clone();
        sandbox.lab_duration_hours = 8;
        sandbox.allocated_at = Utc::now().timestamp() - 5 * 3600;
        db.put_sandbox(sandbox, Utc::now().timestamp()).await.unwrap();

        let released = mark_for_deletion(&state, &allocated.sandbox.sandbox_id, "owner-a")
            .await
            .unwrap();
        assert_eq!(SandboxStatus::PendingDeletion, released.status);
    }

    #[tokio::test]
    async fn test_release_missing_sandbox() {
        let state = test_state().await;

        match mark_for_deletion(&state, "nope", "owner-a").await {
            Err(ServerError::NotOwner) => {}
            other => panic!("Expected NotOwner, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_owned() {
        let state = test_state().await;
        seed_pool(&state, &["sbx-1"]).await;

        let allocated = allocate(&state, request("owner-a")).await.unwrap();

        let fetched = get_owned(&state, &allocated.sandbox.sandbox_id, "owner-a")
            .await
            .unwrap();
        assert_eq!(allocated.sandbox.sandbox_id, fetched.sandbox_id);

        assert!(matches!(
            get_owned(&state, &allocated.sandbox.sandbox_id, "owner-b").await,
            Err(ServerError::NotOwner)
        ));
        assert!(matches!(
            get_owned(&state, "nope", "owner-a").await,
            Err(ServerError::NotOwner)
        ));
    }

    #[test]
    fn test_jittered_backoff_is_capped() {
        for attempt in 0..20 {
            let backoff = jittered_backoff(attempt, 100, 5000);
            assert!(backoff <= Duration::from_millis(5000));
        }
    }
}
