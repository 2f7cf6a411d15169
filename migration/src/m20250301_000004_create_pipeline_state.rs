use sea_orm_migration::prelude::*;

/// Single-row tables holding the chain cursor and the distribution watermark.
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Height::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Height::Height)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(DistributedAt::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DistributedAt::Timestamp)
                            .timestamp_with_time_zone()
                            .not_null()
                            .primary_key(),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DistributedAt::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Height::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Height {
    Table,
    Height,
}

#[derive(DeriveIden)]
enum DistributedAt {
    Table,
    Timestamp,
}
