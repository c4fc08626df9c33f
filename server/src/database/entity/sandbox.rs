//! A sandbox account in the broker pool.
//!
//! The record mirrors one pre-provisioned account in the upstream
//! cloud provider and carries the entire allocation lifecycle.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub type SandboxModel = Model;

/// The status of a sandbox.
#[derive(EnumIter, DeriveActiveEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(Some(16))")]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    /// The sandbox can be handed out.
    #[sea_orm(string_value = "available")]
    Available,

    /// The sandbox is held by exactly one owner.
    #[sea_orm(string_value = "allocated")]
    Allocated,

    /// The sandbox is queued for destruction upstream.
    ///
    /// Owned by the cleanup loop from this point on.
    #[sea_orm(string_value = "pending_deletion")]
    PendingDeletion,

    /// The sandbox exists in the pool but no longer upstream.
    ///
    /// A soft signal that the pool drifted. Only the admin surface
    /// removes these.
    #[sea_orm(string_value = "stale")]
    Stale,

    /// An upstream deletion attempt failed.
    ///
    /// The cleanup loop retries these until the attempt cap is reached.
    #[sea_orm(string_value = "deletion_failed")]
    DeletionFailed,
}

/// A sandbox account.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "sandbox")]
pub struct Model {
    /// Stable ID of the sandbox within the broker.
    ///
    /// Derived from the upstream record's internal numeric handle
    /// on insertion by the sync loop.
    #[sea_orm(primary_key, auto_increment = false)]
    pub sandbox_id: String,

    /// Human-readable name.
    ///
    /// May carry a prefix used for filtered allocation.
    pub name: String,

    /// Opaque handle identifying the account upstream.
    ///
    /// Stored exactly as received on listing; the upstream adapter
    /// derives its deletion handle from the tail segment.
    pub external_id: String,

    /// The status of the sandbox.
    pub status: SandboxStatus,

    /// Owner holding the current allocation, if any.
    pub allocated_to_owner: Option<String>,

    /// Timestamp of the current allocation, seconds since epoch.
    ///
    /// Always populated: 0 when unallocated, so it can serve as the
    /// sort key of the (status, allocated_at) index.
    pub allocated_at: i64,

    /// Per-sandbox deadline horizon, in hours.
    pub lab_duration_hours: i32,

    /// Timestamp the sandbox was marked for deletion, if any.
    pub deletion_requested_at: Option<i64>,

    /// Number of failed upstream deletion attempts.
    pub deletion_retry_count: i32,

    /// Timestamp of the last sync-loop refresh.
    pub last_synced: Option<i64>,

    /// Idempotency key of the current allocation.
    pub idempotency_key: Option<String>,

    /// Opaque grouping tag. Not used for allocation decisions.
    pub lab_tag: Option<String>,

    /// Timestamp when the record is created.
    pub created_at: i64,

    /// Timestamp when the record is last updated.
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl Model {
    /// When the allocation expires, without the grace period.
    pub fn expires_at(&self) -> Option<i64> {
        if self.status == SandboxStatus::Allocated && self.allocated_at > 0 {
            Some(self.allocated_at + i64::from(self.lab_duration_hours) * 3600)
        } else {
            None
        }
    }

    /// Whether the allocation is past its grace-extended deadline.
    pub fn is_expired(&self, now: i64, grace: std::time::Duration) -> bool {
        match self.expires_at() {
            Some(expires_at) => now > expires_at + grace.as_secs() as i64,
            None => false,
        }
    }

    /// Whether the sandbox is currently held by `owner`.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.status == SandboxStatus::Allocated
            && self.allocated_to_owner.as_deref() == Some(owner)
    }

    pub fn can_be_allocated(&self) -> bool {
        self.status == SandboxStatus::Available
    }
}

impl ActiveModelBehavior for ActiveModel {}
