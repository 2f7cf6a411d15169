use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RewardsQueue::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RewardsQueue::Address)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    // uDEC
                    .col(ColumnDef::new(RewardsQueue::Reward).big_integer().not_null())
                    .col(
                        ColumnDef::new(RewardsQueue::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .check(Expr::col(RewardsQueue::Reward).gt(0))
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RewardsQueue::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RewardsQueue {
    Table,
    Address,
    Reward,
    CreatedAt,
}
