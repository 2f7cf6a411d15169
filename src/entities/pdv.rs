//! `SeaORM` Entity for the pdv table

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pdv")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub address: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    /// Reward transaction hash, empty for rewardless submissions
    pub tx: String,
    pub device: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub object_types: Json,
    #[sea_orm(column_type = "Decimal(Some((24, 18)))")]
    pub reward: Decimal,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
