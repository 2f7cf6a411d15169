//! Blockchain seam: reward broadcasts and the block stream.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod evm;
pub mod memory;

pub use evm::EvmChain;
pub use memory::{Broadcast, MemoryChain};

/// Message-count limit of a single on-chain transaction.
pub const MAX_MESSAGES_PER_TX: usize = 25;

/// One receiver of a `DistributeRewards` transaction, amount in DEC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardLine {
    pub receiver: String,
    pub reward: Decimal,
}

/// One receiver of a `SendStakes` transaction, amount in uDEC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeLine {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockMessage {
    ResetAccount { owner: String },
    Other { kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: u64,
    pub messages: Vec<BlockMessage>,
}

#[async_trait]
pub trait Chain: Send + Sync {
    /// Broadcast one transaction paying every line; returns its hash.
    async fn distribute_rewards(&self, rewards: &[RewardLine]) -> Result<String>;

    /// Broadcast one multi-recipient transfer; returns its hash.
    async fn send_stakes(&self, stakes: &[StakeLine], memo: &str) -> Result<String>;

    /// `Ok(None)` while the block at `height` is not produced yet.
    async fn block(&self, height: u64) -> Result<Option<Block>>;

    /// Canonical form of `address`, the one block messages carry, or `None`
    /// when it cannot receive a transfer on this chain.
    fn normalize_address(&self, address: &str) -> Option<String> {
        (!address.is_empty()).then(|| address.to_string())
    }

    async fn ping(&self) -> Result<()>;
}
