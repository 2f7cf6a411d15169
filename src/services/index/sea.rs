//! Postgres-backed index via sea-orm.
//!
//! `SeaIndex<DatabaseConnection>` is the pool-level handle; each statement
//! runs in its own implicit transaction. `SeaIndex<DatabaseTransaction>` is
//! what `begin` hands out.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rust_decimal::Decimal;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectOptions, ConnectionTrait, DatabaseBackend,
    DatabaseConnection, DatabaseTransaction, EntityTrait, FromQueryResult, QueryFilter,
    QueryOrder, QuerySelect, Statement, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use tracing::info;

use super::{epoch, Database, Index, Transaction, WindowLock};
use crate::config::DbConfig;
use crate::entities::{distributed_at, height, pdv, profile, rewards_queue};
use crate::error::{Error, Result};
use crate::models::pdv::validate_reward;
use crate::models::{PdvDelta, PdvMessageMeta, PdvMeta, Profile, ProfileParams, RewardsQueueItem};

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const PDV_DELTA_SQL: &str = r#"
    SELECT COALESCE(SUM(reward), 0) AS delta
    FROM pdv
    WHERE address = $1
      AND reward > 0
      AND created_at > COALESCE((SELECT MAX("timestamp") FROM distributed_at), to_timestamp(0))
"#;

const PDV_TOTAL_DELTA_SQL: &str = r#"
    SELECT COALESCE(SUM(reward), 0) AS delta
    FROM pdv
    WHERE reward > 0
      AND created_at > COALESCE((SELECT MAX("timestamp") FROM distributed_at), to_timestamp(0))
"#;

const PDV_DELTA_LIST_SQL: &str = r#"
    SELECT address, SUM(reward) AS delta
    FROM pdv
    WHERE reward > 0
      AND created_at > COALESCE((SELECT MAX("timestamp") FROM distributed_at), to_timestamp(0))
      AND created_at <= $1
    GROUP BY address
    ORDER BY address
"#;

/// Advisory lock key of the rewards window.
const REWARDS_WINDOW_LOCK: i64 = 0x5044_5652_5744;

#[derive(Debug, FromQueryResult)]
struct DeltaRow {
    address: String,
    delta: Decimal,
}

#[derive(Debug, FromQueryResult)]
struct TotalDeltaRow {
    delta: Decimal,
}

pub struct SeaIndex<C = DatabaseConnection> {
    conn: C,
}

impl SeaIndex<DatabaseConnection> {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    /// Open the pool. Any failure here is fatal to start-up.
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let mut options = ConnectOptions::new(config.dsn.clone());
        options
            .max_connections(config.max_open_conns)
            .min_connections(config.max_idle_conns.min(config.max_open_conns))
            .connect_timeout(CONNECT_TIMEOUT)
            .acquire_timeout(CONNECT_TIMEOUT)
            .sqlx_logging(false);

        let conn = sea_orm::Database::connect(options)
            .await
            .map_err(|e| Error::fatal(format!("connect database: {}", e)))?;

        info!(
            max_open_conns = config.max_open_conns,
            max_idle_conns = config.max_idle_conns,
            "Connected to database"
        );
        Ok(Self::new(conn))
    }

    pub async fn migrate(&self) -> Result<()> {
        migration::Migrator::up(&self.conn, None)
            .await
            .map_err(|e| Error::fatal(format!("run migrations: {}", e)))?;
        info!("Database migrations applied");
        Ok(())
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::invalid(format!("{} {} out of range", what, value)))
}

fn profile_from_model(model: profile::Model) -> Profile {
    Profile {
        address: model.address,
        first_name: model.first_name,
        last_name: model.last_name,
        bio: model.bio,
        avatar: model.avatar,
        gender: model.gender,
        birthday: model.birthday,
        banned: model.banned,
        updated_at: model.updated_at.with_timezone(&Utc),
        created_at: model.created_at.with_timezone(&Utc),
    }
}

fn pdv_meta_from_model(model: pdv::Model) -> Result<PdvMeta> {
    let object_types: BTreeMap<String, u16> = serde_json::from_value(model.object_types)
        .map_err(|e| Error::transient(format!("decode object_types: {}", e)))?;

    Ok(PdvMeta {
        address: model.address,
        id: model.id as u64,
        tx: model.tx,
        device: model.device,
        reward: model.reward,
        object_types,
        created_at: model.created_at.with_timezone(&Utc),
    })
}

#[async_trait]
impl<C> Index for SeaIndex<C>
where
    C: ConnectionTrait + Send + Sync + 'static,
{
    async fn get_height(&self) -> Result<u64> {
        let row = height::Entity::find()
            .order_by_desc(height::Column::Height)
            .one(&self.conn)
            .await?;
        row.map(|r| r.height as u64).ok_or(Error::NotFound)
    }

    async fn set_height(&self, value: u64) -> Result<()> {
        let value = to_i64(value, "height")?;
        height::Entity::delete_many().exec(&self.conn).await?;
        height::Entity::insert(height::ActiveModel { height: Set(value) })
            .exec_without_returning(&self.conn)
            .await?;
        Ok(())
    }

    async fn get_profile(&self, address: &str) -> Result<Profile> {
        profile::Entity::find_by_id(address.to_string())
            .one(&self.conn)
            .await?
            .map(profile_from_model)
            .ok_or(Error::NotFound)
    }

    async fn get_profiles(&self, addresses: &[String]) -> Result<Vec<Profile>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let rows = profile::Entity::find()
            .filter(profile::Column::Address.is_in(addresses.iter().cloned()))
            .order_by_asc(profile::Column::Address)
            .all(&self.conn)
            .await?;
        Ok(rows.into_iter().map(profile_from_model).collect())
    }

    async fn set_profile(&self, params: &ProfileParams) -> Result<()> {
        if params.address.is_empty() {
            return Err(Error::invalid("empty address"));
        }
        let now = Utc::now().fixed_offset();
        let model = profile::ActiveModel {
            address: Set(params.address.clone()),
            first_name: Set(params.first_name.clone()),
            last_name: Set(params.last_name.clone()),
            bio: Set(params.bio.clone()),
            avatar: Set(params.avatar.clone()),
            gender: Set(params.gender.clone()),
            birthday: Set(params.birthday),
            banned: Set(false),
            updated_at: Set(now),
            created_at: Set(now),
        };

        profile::Entity::insert(model)
            .on_conflict(
                OnConflict::column(profile::Column::Address)
                    .update_columns([
                        profile::Column::FirstName,
                        profile::Column::LastName,
                        profile::Column::Bio,
                        profile::Column::Avatar,
                        profile::Column::Gender,
                        profile::Column::Birthday,
                        profile::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.conn)
            .await?;
        Ok(())
    }

    async fn set_profile_banned(&self, address: &str, banned: bool) -> Result<()> {
        let result = profile::Entity::update_many()
            .col_expr(profile::Column::Banned, Expr::value(banned))
            .col_expr(profile::Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(profile::Column::Address.eq(address))
            .exec(&self.conn)
            .await?;
        if result.rows_affected == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn delete_profile(&self, address: &str) -> Result<()> {
        profile::Entity::delete_by_id(address.to_string())
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn set_pdv_meta(
        &self,
        address: &str,
        id: u64,
        tx: &str,
        device: &str,
        meta: &PdvMessageMeta,
    ) -> Result<()> {
        validate_reward(meta.reward)?;
        let object_types = serde_json::to_value(&meta.object_types)
            .map_err(|e| Error::invalid(format!("encode object_types: {}", e)))?;

        let model = pdv::ActiveModel {
            address: Set(address.to_string()),
            id: Set(to_i64(id, "id")?),
            tx: Set(tx.to_string()),
            device: Set(device.to_string()),
            object_types: Set(object_types),
            reward: Set(meta.reward),
            created_at: Set(Utc::now().fixed_offset()),
        };
        pdv::Entity::insert(model)
            .exec_without_returning(&self.conn)
            .await?;
        Ok(())
    }

    async fn get_pdv_meta(&self, address: &str, id: u64) -> Result<PdvMeta> {
        let id = to_i64(id, "id")?;
        let model = pdv::Entity::find_by_id((address.to_string(), id))
            .one(&self.conn)
            .await?
            .ok_or(Error::NotFound)?;
        pdv_meta_from_model(model)
    }

    async fn list_pdv(&self, address: &str, from: u64, limit: u64) -> Result<Vec<u64>> {
        let ids: Vec<i64> = pdv::Entity::find()
            .select_only()
            .column(pdv::Column::Id)
            .filter(pdv::Column::Address.eq(address))
            .order_by_desc(pdv::Column::Id)
            .offset(from)
            .limit(limit)
            .into_tuple()
            .all(&self.conn)
            .await?;
        Ok(ids.into_iter().map(|id| id as u64).collect())
    }

    async fn delete_pdv(&self, address: &str) -> Result<()> {
        pdv::Entity::delete_many()
            .filter(pdv::Column::Address.eq(address))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn get_pdv_delta(&self, address: &str) -> Result<Decimal> {
        let row = TotalDeltaRow::find_by_statement(Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            PDV_DELTA_SQL,
            [address.into()],
        ))
        .one(&self.conn)
        .await?;
        Ok(row.map(|r| r.delta).unwrap_or(Decimal::ZERO))
    }

    async fn get_pdv_total_delta(&self) -> Result<Decimal> {
        let row = TotalDeltaRow::find_by_statement(Statement::from_string(
            DatabaseBackend::Postgres,
            PDV_TOTAL_DELTA_SQL,
        ))
        .one(&self.conn)
        .await?;
        Ok(row.map(|r| r.delta).unwrap_or(Decimal::ZERO))
    }

    async fn get_pdv_delta_list(&self, until: DateTime<Utc>) -> Result<Vec<PdvDelta>> {
        let rows = DeltaRow::find_by_statement(Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            PDV_DELTA_LIST_SQL,
            [until.fixed_offset().into()],
        ))
        .all(&self.conn)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| PdvDelta {
                address: r.address,
                delta: r.delta,
            })
            .collect())
    }

    async fn get_pdv_rewards_distributed_date(&self) -> Result<DateTime<Utc>> {
        let row = distributed_at::Entity::find()
            .order_by_desc(distributed_at::Column::Timestamp)
            .one(&self.conn)
            .await?;
        Ok(row
            .map(|r| r.timestamp.with_timezone(&Utc))
            .unwrap_or_else(epoch))
    }

    async fn set_pdv_rewards_distributed_date(&self, at: DateTime<Utc>) -> Result<()> {
        distributed_at::Entity::delete_many().exec(&self.conn).await?;
        distributed_at::Entity::insert(distributed_at::ActiveModel {
            timestamp: Set(at.fixed_offset()),
        })
        .exec_without_returning(&self.conn)
        .await?;
        Ok(())
    }

    async fn create_rewards_queue_item(&self, address: &str, reward: u64) -> Result<()> {
        if reward == 0 {
            return Err(Error::invalid("rewards queue item must be positive"));
        }
        let model = rewards_queue::ActiveModel {
            address: Set(address.to_string()),
            reward: Set(to_i64(reward, "reward")?),
            created_at: Set(Utc::now().fixed_offset()),
        };
        rewards_queue::Entity::insert(model)
            .exec_without_returning(&self.conn)
            .await?;
        Ok(())
    }

    async fn get_rewards_queue_item_list(&self) -> Result<Vec<RewardsQueueItem>> {
        let rows = rewards_queue::Entity::find()
            .order_by_asc(rewards_queue::Column::Address)
            .all(&self.conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| RewardsQueueItem {
                address: r.address,
                reward: r.reward as u64,
                created_at: r.created_at.with_timezone(&Utc),
            })
            .collect())
    }

    async fn delete_rewards_queue_item(&self, address: &str) -> Result<()> {
        rewards_queue::Entity::delete_by_id(address.to_string())
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        tokio::time::timeout(
            PING_TIMEOUT,
            self.conn
                .execute(Statement::from_string(DatabaseBackend::Postgres, "SELECT 1")),
        )
        .await??;
        Ok(())
    }
}

#[async_trait]
impl Database for SeaIndex<DatabaseConnection> {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let txn = self.conn.begin().await?;
        Ok(Box::new(SeaIndex { conn: txn }))
    }
}

impl Transaction for SeaIndex<DatabaseTransaction> {
    fn lock_rewards_window(&self, mode: WindowLock) -> BoxFuture<'_, Result<()>> {
        let sql = match mode {
            WindowLock::Shared => "SELECT pg_advisory_xact_lock_shared($1)",
            WindowLock::Exclusive => "SELECT pg_advisory_xact_lock($1)",
        };
        Box::pin(async move {
            self.conn
                .execute(Statement::from_sql_and_values(
                    DatabaseBackend::Postgres,
                    sql,
                    [REWARDS_WINDOW_LOCK.into()],
                ))
                .await?;
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            self.conn.commit().await?;
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            self.conn.rollback().await?;
            Ok(())
        })
    }
}
