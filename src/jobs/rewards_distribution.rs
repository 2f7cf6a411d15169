//! Rewards Distribution Jobs
//!
//! Two independent loops over the same index and chain client:
//!
//! * prepare: once the distribution interval has elapsed, split the pool
//!   across addresses in proportion to their deltas and queue the payouts,
//!   advancing the watermark in the same transaction.
//! * drain: pay queued items in chunks, one multi-recipient transfer per
//!   chunk, deleting a chunk only after its broadcast succeeded.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::models::pdv::REWARD_SCALE;
use crate::models::PdvDelta;
use crate::services::chain::{Chain, StakeLine, MAX_MESSAGES_PER_TX};
use crate::services::index::{Database, Index, WindowLock};

/// How often prepare checks whether a window has elapsed.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// How often the rewards queue is drained.
pub const DRAIN_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// The interval since the last distribution has not elapsed
    NotDue { next_at: DateTime<Utc> },
    /// Nothing accrued; the watermark stays put
    NothingAccrued,
    /// Payouts queued and watermark advanced
    Queued { items: usize, total: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub chunks: usize,
    pub items: usize,
    pub txs: Vec<String>,
}

pub struct RewardsDistributor {
    db: Arc<dyn Database>,
    chain: Arc<dyn Chain>,
    /// uDEC per window
    pool_size: u64,
    interval: Duration,
    memo: String,
}

/// Decimal DEC as an integer count of 10^-18 units, truncating deeper digits.
fn to_base_units(value: Decimal) -> U256 {
    if value.is_sign_negative() {
        return U256::ZERO;
    }
    let mantissa = U256::from(value.mantissa().unsigned_abs());
    let scale = value.scale();
    if scale <= REWARD_SCALE {
        mantissa * U256::from(10u64).pow(U256::from(REWARD_SCALE - scale))
    } else {
        mantissa / U256::from(10u64).pow(U256::from(scale - REWARD_SCALE))
    }
}

/// Split `pool` uDEC across `deltas`: `floor(delta_i * pool / sum)`, zero
/// shares dropped. The shares never add up to more than `pool`.
pub fn compute_rewards(deltas: &[PdvDelta], pool: u64) -> Vec<StakeLine> {
    let units: Vec<U256> = deltas.iter().map(|d| to_base_units(d.delta)).collect();
    let sum = units.iter().fold(U256::ZERO, |acc, u| acc + *u);
    if sum.is_zero() {
        return Vec::new();
    }

    let pool = U256::from(pool);
    deltas
        .iter()
        .zip(units)
        .filter_map(|(delta, units)| {
            // share <= pool, which fits in u64
            let share: u64 = (units * pool / sum).to::<u64>();
            (share > 0).then(|| StakeLine {
                address: delta.address.clone(),
                amount: share,
            })
        })
        .collect()
}

impl RewardsDistributor {
    pub fn new(
        db: Arc<dyn Database>,
        chain: Arc<dyn Chain>,
        pool_size: u64,
        interval: Duration,
        memo: impl Into<String>,
    ) -> Self {
        Self {
            db,
            chain,
            pool_size,
            interval,
            memo: memo.into(),
        }
    }

    /// Snapshot deltas into the rewards queue if the window elapsed at `now`.
    pub async fn prepare(&self, now: DateTime<Utc>) -> Result<PrepareOutcome> {
        let window = TimeDelta::from_std(self.interval)
            .map_err(|e| Error::fatal(format!("rewards interval: {}", e)))?;

        let tx = self.db.begin().await?;
        tx.lock_rewards_window(WindowLock::Exclusive).await?;

        let distributed_at = tx.get_pdv_rewards_distributed_date().await?;
        let next_at = distributed_at
            .checked_add_signed(window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if now < next_at {
            tx.rollback().await?;
            return Ok(PrepareOutcome::NotDue { next_at });
        }

        // Rows stamped after `now` belong to the next window
        let deltas = tx.get_pdv_delta_list(now).await?;
        let sum: Decimal = deltas.iter().map(|d| d.delta).sum();
        if sum <= Decimal::ZERO {
            debug!("No rewards accrued since {}", distributed_at);
            tx.rollback().await?;
            return Ok(PrepareOutcome::NothingAccrued);
        }

        let rewards = compute_rewards(&deltas, self.pool_size);
        for reward in &rewards {
            tx.create_rewards_queue_item(&reward.address, reward.amount).await?;
        }
        tx.set_pdv_rewards_distributed_date(now).await?;
        tx.commit().await?;

        let total: u64 = rewards.iter().map(|r| r.amount).sum();
        info!(
            "Queued rewards distribution: {} of {} uDEC to {} addresses (delta sum {})",
            total,
            self.pool_size,
            rewards.len(),
            sum
        );
        Ok(PrepareOutcome::Queued {
            items: rewards.len(),
            total,
        })
    }

    /// Pay the rewards queue in address order, stopping at the first failed
    /// broadcast. Chunks before the failure stay paid and deleted.
    pub async fn drain(&self, shutdown: &CancellationToken) -> Result<DrainReport> {
        let items = self.db.get_rewards_queue_item_list().await?;
        let mut report = DrainReport::default();
        if items.is_empty() {
            return Ok(report);
        }

        for chunk in items.chunks(MAX_MESSAGES_PER_TX) {
            if shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let lines: Vec<StakeLine> = chunk
                .iter()
                .map(|item| StakeLine {
                    address: item.address.clone(),
                    amount: item.reward,
                })
                .collect();

            let hash = self.chain.send_stakes(&lines, &self.memo).await.map_err(|e| {
                warn!("Rewards broadcast of chunk {} failed, retrying next tick: {}", report.chunks + 1, e);
                e
            })?;

            let tx = self.db.begin().await?;
            for item in chunk {
                tx.delete_rewards_queue_item(&item.address).await?;
            }
            if let Err(e) = tx.commit().await {
                error!("Chunk paid in {} could not be removed from the rewards queue: {}", hash, e);
                return Err(e);
            }

            report.chunks += 1;
            report.items += chunk.len();
            report.txs.push(hash);
        }

        info!("Drained rewards queue: {} items in {} chunks", report.items, report.chunks);
        Ok(report)
    }
}

/// Start the rewards prepare job
///
/// Ticks every `CHECK_INTERVAL`; the first tick fires immediately.
pub fn start_rewards_prepare_job(
    distributor: Arc<RewardsDistributor>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Rewards prepare job started (pool {} uDEC every {}s)",
            distributor.pool_size,
            distributor.interval.as_secs()
        );

        let mut ticker = interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match distributor.prepare(Utc::now()).await {
                        Ok(PrepareOutcome::NotDue { next_at }) => debug!("Distribution not due until {}", next_at),
                        Ok(_) => {}
                        Err(e) => error!("Rewards prepare failed: {}", e),
                    }
                }
            }
        }

        info!("Rewards prepare job stopped");
    })
}

/// Start the rewards drain job
///
/// Drains once at start-up, then every `DRAIN_INTERVAL`.
pub fn start_rewards_drain_job(
    distributor: Arc<RewardsDistributor>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Rewards drain job started");

        let mut ticker = interval(DRAIN_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match distributor.drain(&shutdown).await {
                        Ok(_) | Err(Error::Cancelled) => {}
                        Err(e) => error!("Rewards drain stopped: {}", e),
                    }
                }
            }
        }

        info!("Rewards drain job stopped");
    })
}
