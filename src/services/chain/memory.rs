//! Scripted chain for tests: records broadcasts, serves pushed blocks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{evm, Block, BlockMessage, Chain, RewardLine, StakeLine};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Broadcast {
    DistributeRewards {
        hash: String,
        lines: Vec<RewardLine>,
    },
    SendStakes {
        hash: String,
        lines: Vec<StakeLine>,
        memo: String,
    },
}

impl Broadcast {
    pub fn hash(&self) -> &str {
        match self {
            Broadcast::DistributeRewards { hash, .. } | Broadcast::SendStakes { hash, .. } => hash,
        }
    }
}

#[derive(Default)]
pub struct MemoryChain {
    broadcasts: Mutex<Vec<Broadcast>>,
    attempts: AtomicUsize,
    failing_attempts: Mutex<BTreeSet<usize>>,
    blocks: Mutex<BTreeMap<u64, Block>>,
    tip: AtomicU64,
    failing_fetches: AtomicUsize,
    fetches: AtomicUsize,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful broadcasts, in order.
    pub fn broadcasts(&self) -> Vec<Broadcast> {
        self.broadcasts.lock().clone()
    }

    /// Make the `n`-th broadcast attempt from now on (1-based) fail.
    pub fn fail_broadcast_attempt(&self, n: usize) {
        let base = self.attempts.load(Ordering::SeqCst);
        self.failing_attempts.lock().insert(base + n);
    }

    /// Serve `messages` at `height` and raise the tip to it.
    pub fn push_block(&self, height: u64, messages: Vec<BlockMessage>) {
        self.blocks.lock().insert(height, Block { height, messages });
        self.tip.fetch_max(height, Ordering::SeqCst);
    }

    /// Heights at or below the tip without pushed messages are empty blocks.
    pub fn set_tip(&self, height: u64) {
        self.tip.store(height, Ordering::SeqCst);
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Block fetch calls so far, including failed ones.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn record(&self, make: impl FnOnce(String) -> Broadcast) -> Result<String> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_attempts.lock().remove(&attempt) {
            return Err(Error::transient(format!(
                "memory chain: injected failure of broadcast {}",
                attempt
            )));
        }

        let mut broadcasts = self.broadcasts.lock();
        let hash = format!("0x{:064x}", broadcasts.len() + 1);
        broadcasts.push(make(hash.clone()));
        Ok(hash)
    }
}

#[async_trait]
impl Chain for MemoryChain {
    async fn distribute_rewards(&self, rewards: &[RewardLine]) -> Result<String> {
        if rewards.is_empty() {
            return Err(Error::invalid("distribute rewards without receivers"));
        }
        self.record(|hash| Broadcast::DistributeRewards {
            hash,
            lines: rewards.to_vec(),
        })
    }

    async fn send_stakes(&self, stakes: &[StakeLine], memo: &str) -> Result<String> {
        if stakes.is_empty() {
            return Err(Error::invalid("send stakes without receivers"));
        }
        self.record(|hash| Broadcast::SendStakes {
            hash,
            lines: stakes.to_vec(),
            memo: memo.to_string(),
        })
    }

    async fn block(&self, height: u64) -> Result<Option<Block>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let failing = self.failing_fetches.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_fetches.store(failing - 1, Ordering::SeqCst);
            return Err(Error::transient("memory chain: injected fetch failure"));
        }

        if height > self.tip.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(self.blocks.lock().get(&height).cloned().unwrap_or(Block {
            height,
            messages: Vec::new(),
        })))
    }

    /// `0x` addresses follow the EVM rules; anything else non-empty passes.
    fn normalize_address(&self, address: &str) -> Option<String> {
        if address.starts_with("0x") {
            evm::normalize_address(address)
        } else {
            (!address.is_empty()).then(|| address.to_string())
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_broadcast_failure_is_not_recorded() {
        let chain = MemoryChain::new();
        let line = StakeLine {
            address: "a".to_string(),
            amount: 1,
        };

        chain.fail_broadcast_attempt(2);
        assert!(chain.send_stakes(&[line.clone()], "m").await.is_ok());
        assert!(chain.send_stakes(&[line.clone()], "m").await.is_err());
        assert!(chain.send_stakes(&[line], "m").await.is_ok());
        assert_eq!(chain.broadcasts().len(), 2);
    }

    #[tokio::test]
    async fn test_blocks_above_tip_are_pending() {
        let chain = MemoryChain::new();
        chain.push_block(
            3,
            vec![BlockMessage::ResetAccount {
                owner: "a".to_string(),
            }],
        );

        assert_eq!(chain.block(2).await.unwrap().unwrap().messages, vec![]);
        assert_eq!(chain.block(3).await.unwrap().unwrap().messages.len(), 1);
        assert!(chain.block(4).await.unwrap().is_none());
    }

    #[test]
    fn test_normalize_address() {
        let chain = MemoryChain::new();
        assert_eq!(chain.normalize_address("alice").as_deref(), Some("alice"));
        assert_eq!(
            chain.normalize_address("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").as_deref(),
            Some("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed")
        );
        assert_eq!(chain.normalize_address("0x5a"), None);
        assert_eq!(chain.normalize_address(""), None);
    }
}
