//! Metadata index: PDV meta, profiles, the rewards queue and pipeline state.
//!
//! Every operation is available both on the pool-level handle and on an open
//! transaction. A transaction is an owned handle: `commit` consumes it and
//! dropping it uncommitted rolls back, so it cannot outlive its scope.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rust_decimal::Decimal;

use crate::error::Result;
use crate::models::{PdvDelta, PdvMessageMeta, PdvMeta, Profile, ProfileParams, RewardsQueueItem};

pub mod memory;
pub mod sea;

pub use memory::{MemoryIndex, MemoryTx};
pub use sea::SeaIndex;

#[async_trait]
pub trait Index: Send + Sync {
    /// Highest fully processed block; `NotFound` before the first block.
    async fn get_height(&self) -> Result<u64>;
    async fn set_height(&self, height: u64) -> Result<()>;

    async fn get_profile(&self, address: &str) -> Result<Profile>;
    /// Existing profiles among `addresses`, ordered by address.
    async fn get_profiles(&self, addresses: &[String]) -> Result<Vec<Profile>>;
    /// Upsert; bumps `updated_at` and leaves `banned` untouched.
    async fn set_profile(&self, params: &ProfileParams) -> Result<()>;
    async fn set_profile_banned(&self, address: &str, banned: bool) -> Result<()>;
    async fn delete_profile(&self, address: &str) -> Result<()>;

    /// Insert; `AlreadyExists` when `(address, id)` is taken.
    async fn set_pdv_meta(
        &self,
        address: &str,
        id: u64,
        tx: &str,
        device: &str,
        meta: &PdvMessageMeta,
    ) -> Result<()>;
    async fn get_pdv_meta(&self, address: &str, id: u64) -> Result<PdvMeta>;
    /// Ids newest first.
    async fn list_pdv(&self, address: &str, from: u64, limit: u64) -> Result<Vec<u64>>;
    async fn delete_pdv(&self, address: &str) -> Result<()>;

    /// Sum of rewards created strictly after the distribution watermark.
    async fn get_pdv_delta(&self, address: &str) -> Result<Decimal>;
    async fn get_pdv_total_delta(&self) -> Result<Decimal>;
    /// Non-zero deltas of rewards created after the watermark and no later
    /// than `until`, ordered by address.
    async fn get_pdv_delta_list(&self, until: DateTime<Utc>) -> Result<Vec<PdvDelta>>;

    /// Defaults to the Unix epoch before the first distribution.
    async fn get_pdv_rewards_distributed_date(&self) -> Result<DateTime<Utc>>;
    async fn set_pdv_rewards_distributed_date(&self, at: DateTime<Utc>) -> Result<()>;

    /// `AlreadyExists` when the address already has a pending payout.
    async fn create_rewards_queue_item(&self, address: &str, reward: u64) -> Result<()>;
    /// Ordered by address.
    async fn get_rewards_queue_item_list(&self) -> Result<Vec<RewardsQueueItem>>;
    async fn delete_rewards_queue_item(&self, address: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

/// How a transaction holds the rewards window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowLock {
    /// Inserting pdv rows; any number of holders
    Shared,
    /// Snapshotting deltas and advancing the watermark
    Exclusive,
}

pub trait Transaction: Index {
    /// Held until the transaction ends. Rows stamped by a `Shared` holder
    /// are committed before an `Exclusive` holder reads deltas.
    fn lock_rewards_window(&self, mode: WindowLock) -> BoxFuture<'_, Result<()>>;
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

#[async_trait]
pub trait Database: Index {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// Unix epoch, the watermark before any distribution happened.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}
