use sea_orm_migration::prelude::*;

use crate::database::entity::sandbox::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250301_000001_create_sandbox_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entity)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Column::SandboxId)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Column::Name).string().not_null())
                    .col(ColumnDef::new(Column::ExternalId).string().not_null())
                    .col(ColumnDef::new(Column::Status).string_len(16).not_null())
                    .col(ColumnDef::new(Column::AllocatedToOwner).string().null())
                    .col(
                        ColumnDef::new(Column::AllocatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Column::LabDurationHours)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Column::DeletionRequestedAt)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Column::DeletionRetryCount)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Column::LastSynced).big_integer().null())
                    .col(ColumnDef::new(Column::IdempotencyKey).string().null())
                    .col(ColumnDef::new(Column::LabTag).string().null())
                    .col(ColumnDef::new(Column::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(Column::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        // Feeds the allocator candidate scan, the cleanup drain and the
        // expiry sweep. `allocated_at` is never null (0 when unallocated)
        // so the composite key is always populated.
        manager
            .create_index(
                Index::create()
                    .name("idx-sandbox-status-allocated-at")
                    .table(Entity)
                    .col(Column::Status)
                    .col(Column::AllocatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-sandbox-idempotency-key")
                    .table(Entity)
                    .col(Column::IdempotencyKey)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-sandbox-name")
                    .table(Entity)
                    .col(Column::Name)
                    .to_owned(),
            )
            .await
    }
}
