use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A pending on-chain payout. At most one per address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardsQueueItem {
    pub address: String,
    /// Amount in uDEC
    pub reward: u64,
    pub created_at: DateTime<Utc>,
}

/// Rewards accrued by one address since the last distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdvDelta {
    pub address: String,
    pub delta: Decimal,
}
