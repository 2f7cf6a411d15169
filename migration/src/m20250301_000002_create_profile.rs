use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Profile::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Profile::Address)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Profile::FirstName).text().not_null().default(""))
                    .col(ColumnDef::new(Profile::LastName).text().not_null().default(""))
                    .col(ColumnDef::new(Profile::Bio).text().not_null().default(""))
                    .col(ColumnDef::new(Profile::Avatar).text().not_null().default(""))
                    .col(ColumnDef::new(Profile::Gender).text().not_null().default(""))
                    .col(ColumnDef::new(Profile::Birthday).date().null())
                    .col(
                        ColumnDef::new(Profile::Banned)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Profile::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Profile::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Profile::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Profile {
    Table,
    Address,
    FirstName,
    LastName,
    Bio,
    Avatar,
    Gender,
    Birthday,
    Banned,
    UpdatedAt,
    CreatedAt,
}
