use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Pdv::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Pdv::Address).text().not_null())
                    .col(ColumnDef::new(Pdv::Id).big_integer().not_null())
                    .col(ColumnDef::new(Pdv::Tx).text().not_null().default(""))
                    .col(ColumnDef::new(Pdv::Device).text().not_null().default(""))
                    .col(ColumnDef::new(Pdv::ObjectTypes).json_binary().not_null())
                    .col(
                        ColumnDef::new(Pdv::Reward)
                            .decimal_len(24, 18)
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Pdv::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(Index::create().col(Pdv::Address).col(Pdv::Id))
                    .check(Expr::col(Pdv::Reward).gte(0))
                    .to_owned(),
            )
            .await?;

        // Delta sums filter on created_at
        manager
            .create_index(
                Index::create()
                    .name("idx_pdv_created_at")
                    .table(Pdv::Table)
                    .col(Pdv::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Pdv::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Pdv {
    Table,
    Address,
    Id,
    Tx,
    Device,
    ObjectTypes,
    Reward,
    CreatedAt,
}
