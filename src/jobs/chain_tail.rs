//! Chain Tail Job
//!
//! Follows the block stream from the stored cursor and erases a user's
//! state when their account is reset on-chain. The cursor only moves once
//! the block's transaction committed; blob deletion happens afterwards,
//! outside the transaction, and may lag.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::sleep_or_cancelled;
use crate::error::{Error, Result};
use crate::services::blob_store::BlobStore;
use crate::services::chain::{Block, BlockMessage, Chain};
use crate::services::index::{Database, Index};
use crate::services::profile_cache::ProfileCache;

/// Wait before retrying a failed fetch or block handler.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Wait before asking again for a block that is not produced yet.
pub const TIP_DELAY: Duration = Duration::from_secs(1);

/// What handling one block did.
#[derive(Debug)]
pub struct BlockReport {
    pub height: u64,
    pub reset: Vec<String>,
    /// Out-of-transaction blob deletions, one per reset owner
    pub cleanups: Vec<JoinHandle<()>>,
}

pub struct ChainTail {
    db: Arc<dyn Database>,
    blobs: Arc<BlobStore>,
    chain: Arc<dyn Chain>,
    profiles: ProfileCache,
}

impl ChainTail {
    pub fn new(
        db: Arc<dyn Database>,
        blobs: Arc<BlobStore>,
        chain: Arc<dyn Chain>,
        profiles: ProfileCache,
    ) -> Self {
        Self {
            db,
            blobs,
            chain,
            profiles,
        }
    }

    /// First height still to process: one past the cursor, or 1 on a fresh index.
    pub async fn start_height(&self) -> Result<u64> {
        match self.db.get_height().await {
            Ok(height) => Ok(height + 1),
            Err(Error::NotFound) => Ok(1),
            Err(e) => Err(e),
        }
    }

    /// Apply `block` in one transaction and advance the cursor to its height.
    pub async fn handle_block(&self, block: &Block, shutdown: &CancellationToken) -> Result<BlockReport> {
        let tx = self.db.begin().await?;
        let mut reset = Vec::new();

        for message in &block.messages {
            match message {
                BlockMessage::ResetAccount { owner } => {
                    tx.delete_profile(owner).await?;
                    tx.delete_pdv(owner).await?;
                    reset.push(owner.clone());
                }
                BlockMessage::Other { kind } => {
                    debug!("Ignoring {} message at height {}", kind, block.height);
                }
            }
        }
        tx.set_height(block.height).await?;
        tx.commit().await?;

        let mut cleanups = Vec::with_capacity(reset.len());
        for owner in &reset {
            self.profiles.invalidate(owner).await;
            cleanups.push(self.spawn_blob_cleanup(owner.clone(), shutdown.clone()));
            info!("Account {} reset at height {}", owner, block.height);
        }

        Ok(BlockReport {
            height: block.height,
            reset,
            cleanups,
        })
    }

    fn spawn_blob_cleanup(&self, owner: String, shutdown: CancellationToken) -> JoinHandle<()> {
        let blobs = self.blobs.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!("Blob cleanup of {} interrupted by shutdown", owner);
                }
                result = blobs.delete_all(&owner) => {
                    if let Err(e) = result {
                        error!("Blob cleanup of {} failed: {}", owner, e);
                    }
                }
            }
        })
    }

    /// Tail blocks until `shutdown` fires.
    pub async fn run(&self, shutdown: &CancellationToken) {
        let mut height = loop {
            match self.start_height().await {
                Ok(height) => break height,
                Err(e) => {
                    error!("Failed to read block cursor: {}", e);
                    if sleep_or_cancelled(RETRY_DELAY, shutdown).await {
                        return;
                    }
                }
            }
        };
        info!("Chain tail starting at height {}", height);

        loop {
            let fetched = tokio::select! {
                _ = shutdown.cancelled() => return,
                fetched = self.chain.block(height) => fetched,
            };

            let delay = match fetched {
                Ok(Some(block)) => match self.handle_block(&block, shutdown).await {
                    Ok(_) => {
                        height += 1;
                        continue;
                    }
                    Err(e) => {
                        error!("Block handler failed at height {}, retrying: {}", height, e);
                        RETRY_DELAY
                    }
                },
                Ok(None) => TIP_DELAY,
                Err(e) => {
                    warn!("Block fetch failed at height {}, retrying: {}", height, e);
                    RETRY_DELAY
                }
            };

            if sleep_or_cancelled(delay, shutdown).await {
                return;
            }
        }
    }
}

/// Start the chain tail job
pub fn start_chain_tail_job(tail: Arc<ChainTail>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tail.run(&shutdown).await;
        info!("Chain tail job stopped");
    })
}
