//! Database abstraction.
//!
//! The two conditional writes (`conditional_allocate` and
//! `conditional_mark_for_deletion`) are the only places where
//! cross-request consistency is established. Both are single
//! `UPDATE ... RETURNING` statements so they are atomic and
//! linearizable with respect to the targeted row; a condition
//! mismatch surfaces as `None`, never as an error.

pub mod entity;
pub mod migration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use sea_orm::entity::prelude::*;
use sea_orm::query::{QueryOrder, QuerySelect};
use sea_orm::sea_query::{OnConflict, Query};
use sea_orm::{ActiveValue::Set, ConnectionTrait, DatabaseConnection, FromQueryResult};
use serde::Serialize;

use crate::error::{ServerError, ServerResult};
use entity::sandbox::{self, Entity as Sandbox, SandboxModel, SandboxStatus};

/// Sandbox pool counts by status.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PoolStats {
    pub total: u64,
    pub available: u64,
    pub allocated: u64,
    pub pending_deletion: u64,
    pub stale: u64,
    pub deletion_failed: u64,
}

#[async_trait]
pub trait BrokerStore: Send + Sync {
    /// Retrieves a sandbox by ID.
    async fn get_sandbox(&self, sandbox_id: &str) -> ServerResult<Option<SandboxModel>>;

    /// Unconditionally upserts a sandbox, stamping `updated_at`.
    async fn put_sandbox(&self, sandbox: SandboxModel, now: i64) -> ServerResult<SandboxModel>;

    /// Removes a sandbox record.
    async fn delete_sandbox(&self, sandbox_id: &str) -> ServerResult<()>;

    /// Retrieves sandboxes in a given status, ordered by `allocated_at`.
    async fn query_by_status(
        &self,
        status: SandboxStatus,
        limit: Option<u64>,
    ) -> ServerResult<Vec<SandboxModel>>;

    /// Finds the record carrying an idempotency key.
    ///
    /// At most one record is returned. The returned record is not
    /// guaranteed to still be allocated; the caller checks.
    async fn find_allocation_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> ServerResult<Option<SandboxModel>>;

    /// Atomically claims a sandbox for `owner`.
    ///
    /// Succeeds iff the record exists and is `available`. Returns the
    /// new record, or `None` if another caller won the claim.
    async fn conditional_allocate(
        &self,
        sandbox_id: &str,
        owner: &str,
        idempotency_key: &str,
        now: i64,
        lab_tag: Option<&str>,
    ) -> ServerResult<Option<SandboxModel>>;

    /// Atomically transitions an allocation to `pending_deletion`.
    ///
    /// Succeeds iff the record is `allocated` to `owner` and
    /// `allocated_at > min_valid_allocated_at`. Returns the new record,
    /// or `None` on any condition mismatch.
    async fn conditional_mark_for_deletion(
        &self,
        sandbox_id: &str,
        owner: &str,
        now: i64,
        min_valid_allocated_at: i64,
    ) -> ServerResult<Option<SandboxModel>>;

    /// Enumerates the pool with keyset pagination, optionally
    /// restricted to one status.
    async fn enumerate(
        &self,
        status: Option<SandboxStatus>,
        cursor: Option<&str>,
        limit: u64,
    ) -> ServerResult<(Vec<SandboxModel>, Option<String>)>;

    /// Counts sandboxes by status over a full enumeration.
    async fn status_counts(&self) -> ServerResult<PoolStats>;

    /// Removes all sandboxes in a given status. Returns the count.
    async fn bulk_delete_by_status(&self, status: SandboxStatus) -> ServerResult<u64>;

    /// Removes `stale` sandboxes untouched since `cutoff`. Returns the count.
    async fn purge_stale(&self, cutoff: i64) -> ServerResult<u64>;
}

fn to_active_model(sandbox: SandboxModel) -> sandbox::ActiveModel {
    sandbox::ActiveModel {
        sandbox_id: Set(sandbox.sandbox_id),
        name: Set(sandbox.name),
        external_id: Set(sandbox.external_id),
        status: Set(sandbox.status),
        allocated_to_owner: Set(sandbox.allocated_to_owner),
        allocated_at: Set(sandbox.allocated_at),
        lab_duration_hours: Set(sandbox.lab_duration_hours),
        deletion_requested_at: Set(sandbox.deletion_requested_at),
        deletion_retry_count: Set(sandbox.deletion_retry_count),
        last_synced: Set(sandbox.last_synced),
        idempotency_key: Set(sandbox.idempotency_key),
        lab_tag: Set(sandbox.lab_tag),
        created_at: Set(sandbox.created_at),
        updated_at: Set(sandbox.updated_at),
    }
}

fn encode_cursor(sandbox_id: &str) -> String {
    BASE64_STANDARD.encode(sandbox_id.as_bytes())
}

fn decode_cursor(cursor: &str) -> ServerResult<String> {
    let bytes = BASE64_STANDARD
        .decode(cursor.as_bytes())
        .map_err(ServerError::request_error)?;

    String::from_utf8(bytes).map_err(ServerError::request_error)
}

#[async_trait]
impl BrokerStore for DatabaseConnection {
    async fn get_sandbox(&self, sandbox_id: &str) -> ServerResult<Option<SandboxModel>> {
        Sandbox::find_by_id(sandbox_id.to_string())
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn put_sandbox(&self, sandbox: SandboxModel, now: i64) -> ServerResult<SandboxModel> {
        let mut sandbox = sandbox;
        sandbox.updated_at = now;
        if sandbox.created_at == 0 {
            sandbox.created_at = now;
        }

        let model = sandbox.clone();

        Sandbox::insert(to_active_model(sandbox))
            .on_conflict(
                OnConflict::column(sandbox::Column::SandboxId)
                    .update_columns([
                        sandbox::Column::Name,
                        sandbox::Column::ExternalId,
                        sandbox::Column::Status,
                        sandbox::Column::AllocatedToOwner,
                        sandbox::Column::AllocatedAt,
                        sandbox::Column::LabDurationHours,
                        sandbox::Column::DeletionRequestedAt,
                        sandbox::Column::DeletionRetryCount,
                        sandbox::Column::LastSynced,
                        sandbox::Column::IdempotencyKey,
                        sandbox::Column::LabTag,
                        sandbox::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(model)
    }

    async fn delete_sandbox(&self, sandbox_id: &str) -> ServerResult<()> {
        Sandbox::delete_by_id(sandbox_id.to_string())
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn query_by_status(
        &self,
        status: SandboxStatus,
        limit: Option<u64>,
    ) -> ServerResult<Vec<SandboxModel>> {
        let mut query = Sandbox::find()
            .filter(sandbox::Column::Status.eq(status))
            .order_by_asc(sandbox::Column::AllocatedAt);

        if let Some(limit) = limit {
            query = query.limit(limit);
        }

        query.all(self).await.map_err(ServerError::database_error)
    }

    async fn find_allocation_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> ServerResult<Option<SandboxModel>> {
        Sandbox::find()
            .filter(sandbox::Column::IdempotencyKey.eq(idempotency_key))
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn conditional_allocate(
        &self,
        sandbox_id: &str,
        owner: &str,
        idempotency_key: &str,
        now: i64,
        lab_tag: Option<&str>,
    ) -> ServerResult<Option<SandboxModel>> {
        let mut update = Query::update();
        update
            .table(Sandbox)
            .value(sandbox::Column::Status, SandboxStatus::Allocated)
            .value(sandbox::Column::AllocatedToOwner, owner.to_string())
            .value(sandbox::Column::AllocatedAt, now)
            .value(sandbox::Column::IdempotencyKey, idempotency_key.to_string())
            .value(sandbox::Column::UpdatedAt, now)
            .and_where(sandbox::Column::SandboxId.eq(sandbox_id))
            .and_where(sandbox::Column::Status.eq(SandboxStatus::Available))
            .returning_all();

        if let Some(lab_tag) = lab_tag {
            update.value(sandbox::Column::LabTag, lab_tag.to_string());
        }

        let stmt = self.get_database_backend().build(&update);

        sandbox::Model::find_by_statement(stmt)
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn conditional_mark_for_deletion(
        &self,
        sandbox_id: &str,
        owner: &str,
        now: i64,
        min_valid_allocated_at: i64,
    ) -> ServerResult<Option<SandboxModel>> {
        let update = Query::update()
            .table(Sandbox)
            .value(sandbox::Column::Status, SandboxStatus::PendingDeletion)
            .value(sandbox::Column::DeletionRequestedAt, now)
            .value(sandbox::Column::UpdatedAt, now)
            .and_where(sandbox::Column::SandboxId.eq(sandbox_id))
            .and_where(sandbox::Column::Status.eq(SandboxStatus::Allocated))
            .and_where(sandbox::Column::AllocatedToOwner.eq(owner))
            .and_where(sandbox::Column::AllocatedAt.gt(min_valid_allocated_at))
            .returning_all()
            .to_owned();

        let stmt = self.get_database_backend().build(&update);

        sandbox::Model::find_by_statement(stmt)
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn enumerate(
        &self,
        status: Option<SandboxStatus>,
        cursor: Option<&str>,
        limit: u64,
    ) -> ServerResult<(Vec<SandboxModel>, Option<String>)> {
        let mut query = Sandbox::find().order_by_asc(sandbox::Column::SandboxId);

        if let Some(status) = status {
            query = query.filter(sandbox::Column::Status.eq(status));
        }

        if let Some(cursor) = cursor {
            let last_seen = decode_cursor(cursor)?;
            query = query.filter(sandbox::Column::SandboxId.gt(last_seen));
        }

        let sandboxes = query
            .limit(limit)
            .all(self)
            .await
            .map_err(ServerError::database_error)?;

        let next_cursor = if sandboxes.len() as u64 == limit {
            sandboxes.last().map(|s| encode_cursor(&s.sandbox_id))
        } else {
            None
        };

        Ok((sandboxes, next_cursor))
    }

    async fn status_counts(&self) -> ServerResult<PoolStats> {
        let sandboxes = Sandbox::find()
            .all(self)
            .await
            .map_err(ServerError::database_error)?;

        let mut stats = PoolStats::default();
        for sandbox in sandboxes {
            stats.total += 1;
            match sandbox.status {
                SandboxStatus::Available => stats.available += 1,
                SandboxStatus::Allocated => stats.allocated += 1,
                SandboxStatus::PendingDeletion => stats.pending_deletion += 1,
                SandboxStatus::Stale => stats.stale += 1,
                SandboxStatus::DeletionFailed => stats.deletion_failed += 1,
            }
        }

        Ok(stats)
    }

    async fn bulk_delete_by_status(&self, status: SandboxStatus) -> ServerResult<u64> {
        let deletion = Sandbox::delete_many()
            .filter(sandbox::Column::Status.eq(status))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(deletion.rows_affected)
    }

    async fn purge_stale(&self, cutoff: i64) -> ServerResult<u64> {
        let deletion = Sandbox::delete_many()
            .filter(sandbox::Column::Status.eq(SandboxStatus::Stale))
            .filter(sandbox::Column::UpdatedAt.lt(cutoff))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(deletion.rows_affected)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use sea_orm::{ConnectOptions, Database};

    use migration::{Migrator, MigratorTrait};

    /// Connects to a fresh in-memory SQLite database.
    ///
    /// A single connection is required so every query sees the same
    /// memory-backed database.
    pub(crate) async fn setup_db() -> DatabaseConnection {
        let mut options = ConnectOptions::new("sqlite::memory:".to_string());
        options.max_connections(1);

        let db = Database::connect(options)
            .await
            .expect("Could not connect to in-memory SQLite");

        Migrator::up(&db, None)
            .await
            .expect("Could not run migrations");

        db
    }

    pub(crate) fn available_sandbox(sandbox_id: &str) -> SandboxModel {
        SandboxModel {
            sandbox_id: sandbox_id.to_string(),
            name: format!("sandbox-{sandbox_id}"),
            external_id: format!("identity/accounts/{sandbox_id}"),
            status: SandboxStatus::Available,
            allocated_to_owner: None,
            allocated_at: 0,
            lab_duration_hours: 4,
            deletion_requested_at: None,
            deletion_retry_count: 0,
            last_synced: None,
            idempotency_key: None,
            lab_tag: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn test_conditional_allocate() {
        let db = setup_db().await;
        db.put_sandbox(available_sandbox("sbx-1"), 100).await.unwrap();

        let allocated = db
            .conditional_allocate("sbx-1", "owner-a", "key-a", 200, Some("lab-adventure"))
            .await
            .unwrap()
            .expect("First claim should succeed");

        assert_eq!(SandboxStatus::Allocated, allocated.status);
        assert_eq!(Some("owner-a".to_string()), allocated.allocated_to_owner);
        assert_eq!(200, allocated.allocated_at);
        assert_eq!(Some("key-a".to_string()), allocated.idempotency_key);
        assert_eq!(Some("lab-adventure".to_string()), allocated.lab_tag);

        // Second claim loses: the record is no longer available.
        let contended = db
            .conditional_allocate("sbx-1", "owner-b", "key-b", 201, None)
            .await
            .unwrap();
        assert!(contended.is_none());

        let record = db.get_sandbox("sbx-1").await.unwrap().unwrap();
        assert_eq!(Some("owner-a".to_string()), record.allocated_to_owner);
    }

    #[tokio::test]
    async fn test_conditional_allocate_missing_record() {
        let db = setup_db().await;

        let result = db
            .conditional_allocate("nope", "owner-a", "key-a", 100, None)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_conditional_mark_for_deletion() {
        let db = setup_db().await;
        db.put_sandbox(available_sandbox("sbx-1"), 100).await.unwrap();
        db.conditional_allocate("sbx-1", "owner-a", "owner-a", 1000, None)
            .await
            .unwrap()
            .unwrap();

        // Wrong owner fails and leaves the record untouched.
        let wrong_owner = db
            .conditional_mark_for_deletion("sbx-1", "owner-b", 1100, 900)
            .await
            .unwrap();
        assert!(wrong_owner.is_none());

        let record = db.get_sandbox("sbx-1").await.unwrap().unwrap();
        assert_eq!(SandboxStatus::Allocated, record.status);

        // Expired bound fails: allocated_at must be strictly greater.
        let expired = db
            .conditional_mark_for_deletion("sbx-1", "owner-a", 1100, 1000)
            .await
            .unwrap();
        assert!(expired.is_none());

        // Owner within the validity window succeeds.
        let marked = db
            .conditional_mark_for_deletion("sbx-1", "owner-a", 1100, 900)
            .await
            .unwrap()
            .expect("Release should succeed");
        assert_eq!(SandboxStatus::PendingDeletion, marked.status);
        assert_eq!(Some(1100), marked.deletion_requested_at);

        // The release is not repeatable: the record is no longer allocated.
        let repeated = db
            .conditional_mark_for_deletion("sbx-1", "owner-a", 1200, 900)
            .await
            .unwrap();
        assert!(repeated.is_none());
    }

    #[tokio::test]
    async fn test_query_by_status_ordering() {
        let db = setup_db().await;

        for (id, allocated_at) in [("sbx-1", 300), ("sbx-2", 100), ("sbx-3", 200)] {
            let mut sandbox = available_sandbox(id);
            sandbox.status = SandboxStatus::Allocated;
            sandbox.allocated_to_owner = Some(format!("owner-{id}"));
            sandbox.allocated_at = allocated_at;
            db.put_sandbox(sandbox, 400).await.unwrap();
        }
        db.put_sandbox(available_sandbox("sbx-4"), 400).await.unwrap();

        let allocated = db
            .query_by_status(SandboxStatus::Allocated, None)
            .await
            .unwrap();
        let ids: Vec<_> = allocated.iter().map(|s| s.sandbox_id.as_str()).collect();
        assert_eq!(vec!["sbx-2", "sbx-3", "sbx-1"], ids);

        let limited = db
            .query_by_status(SandboxStatus::Allocated, Some(2))
            .await
            .unwrap();
        assert_eq!(2, limited.len());

        let available = db
            .query_by_status(SandboxStatus::Available, None)
            .await
            .unwrap();
        assert_eq!(1, available.len());
    }

    #[tokio::test]
    async fn test_find_allocation_by_idempotency_key() {
        let db = setup_db().await;
        db.put_sandbox(available_sandbox("sbx-1"), 100).await.unwrap();

        assert!(db
            .find_allocation_by_idempotency_key("key-a")
            .await
            .unwrap()
            .is_none());

        db.conditional_allocate("sbx-1", "owner-a", "key-a", 200, None)
            .await
            .unwrap()
            .unwrap();

        let found = db
            .find_allocation_by_idempotency_key("key-a")
            .await
            .unwrap()
            .expect("Idempotency lookup should find the allocation");
        assert_eq!("sbx-1", found.sandbox_id);
    }

    #[tokio::test]
    async fn test_enumerate_pagination() {
        let db = setup_db().await;
        for i in 1..=5 {
            db.put_sandbox(available_sandbox(&format!("sbx-{i}")), 100)
                .await
                .unwrap();
        }

        let (first_page, cursor) = db.enumerate(None, None, 2).await.unwrap();
        assert_eq!(2, first_page.len());
        let cursor = cursor.expect("More pages should exist");

        let (second_page, cursor) = db.enumerate(None, Some(&cursor), 2).await.unwrap();
        assert_eq!(2, second_page.len());
        let cursor = cursor.expect("More pages should exist");

        let (last_page, cursor) = db.enumerate(None, Some(&cursor), 2).await.unwrap();
        assert_eq!(1, last_page.len());
        assert!(cursor.is_none());

        let mut seen: Vec<_> = first_page
            .iter()
            .chain(&second_page)
            .chain(&last_page)
            .map(|s| s.sandbox_id.clone())
            .collect();
        seen.dedup();
        assert_eq!(5, seen.len());
    }

    #[tokio::test]
    async fn test_enumerate_with_status_filter() {
        let db = setup_db().await;
        for i in 1..=4 {
            let mut sandbox = available_sandbox(&format!("sbx-{i}"));
            if i % 2 == 0 {
                sandbox.status = SandboxStatus::Stale;
            }
            db.put_sandbox(sandbox, 100).await.unwrap();
        }

        let (first_page, cursor) = db
            .enumerate(Some(SandboxStatus::Stale), None, 1)
            .await
            .unwrap();
        assert_eq!(1, first_page.len());
        assert_eq!("sbx-2", first_page[0].sandbox_id);
        let cursor = cursor.expect("More stale records should exist");

        let (second_page, _) = db
            .enumerate(Some(SandboxStatus::Stale), Some(&cursor), 1)
            .await
            .unwrap();
        assert_eq!(1, second_page.len());
        assert_eq!("sbx-4", second_page[0].sandbox_id);
    }

    #[tokio::test]
    async fn test_put_sandbox_upsert() {
        let db = setup_db().await;

        let created = db
            .put_sandbox(available_sandbox("sbx-1"), 100)
            .await
            .unwrap();
        assert_eq!(100, created.created_at);
        assert_eq!(100, created.updated_at);

        let mut refreshed = created;
        refreshed.name = "renamed".to_string();
        refreshed.status = SandboxStatus::Stale;
        let updated = db.put_sandbox(refreshed, 200).await.unwrap();
        assert_eq!(100, updated.created_at);
        assert_eq!(200, updated.updated_at);

        let record = db.get_sandbox("sbx-1").await.unwrap().unwrap();
        assert_eq!("renamed", record.name);
        assert_eq!(SandboxStatus::Stale, record.status);
        assert_eq!(200, record.updated_at);
    }

    #[tokio::test]
    async fn test_status_counts_and_bulk_delete() {
        let db = setup_db().await;

        db.put_sandbox(available_sandbox("sbx-1"), 100).await.unwrap();
        let mut stale = available_sandbox("sbx-2");
        stale.status = SandboxStatus::Stale;
        db.put_sandbox(stale, 100).await.unwrap();
        let mut failed = available_sandbox("sbx-3");
        failed.status = SandboxStatus::DeletionFailed;
        db.put_sandbox(failed, 100).await.unwrap();

        let stats = db.status_counts().await.unwrap();
        assert_eq!(3, stats.total);
        assert_eq!(1, stats.available);
        assert_eq!(1, stats.stale);
        assert_eq!(1, stats.deletion_failed);

        let deleted = db
            .bulk_delete_by_status(SandboxStatus::Stale)
            .await
            .unwrap();
        assert_eq!(1, deleted);
        assert_eq!(2, db.status_counts().await.unwrap().total);
    }

    #[tokio::test]
    async fn test_purge_stale_honors_cutoff() {
        let db = setup_db().await;

        let mut old_stale = available_sandbox("sbx-1");
        old_stale.status = SandboxStatus::Stale;
        db.put_sandbox(old_stale, 100).await.unwrap();

        let mut fresh_stale = available_sandbox("sbx-2");
        fresh_stale.status = SandboxStatus::Stale;
        db.put_sandbox(fresh_stale, 900).await.unwrap();

        let purged = db.purge_stale(500).await.unwrap();
        assert_eq!(1, purged);
        assert!(db.get_sandbox("sbx-1").await.unwrap().is_none());
        assert!(db.get_sandbox("sbx-2").await.unwrap().is_some());
    }
}
