//! Create the key/value and sorted-set tables

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(KvEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(KvEntries::Key)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(KvEntries::Value).text().not_null())
                    .col(ColumnDef::new(KvEntries::ExpiresAt).big_integer().null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_kv_entries_expires_at")
                    .table(KvEntries::Table)
                    .col(KvEntries::ExpiresAt)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(SortedEntries::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SortedEntries::SetName).string().not_null())
                    .col(ColumnDef::new(SortedEntries::Member).string().not_null())
                    .col(ColumnDef::new(SortedEntries::Score).double().not_null())
                    .primary_key(
                        Index::create()
                            .col(SortedEntries::SetName)
                            .col(SortedEntries::Member),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sorted_entries_set_score")
                    .table(SortedEntries::Table)
                    .col(SortedEntries::SetName)
                    .col(SortedEntries::Score)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SortedEntries::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(KvEntries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum KvEntries {
    Table,
    Key,
    Value,
    ExpiresAt,
}

#[derive(DeriveIden)]
enum SortedEntries {
    Table,
    SetName,
    Member,
    Score,
}
