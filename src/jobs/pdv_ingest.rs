//! PDV Ingest Job
//!
//! Pulls bulks of signed submissions off the durable queue, stores their
//! encrypted payloads and records meta inside one index transaction that
//! also broadcasts the bulk's reward transaction.
//!
//! The duplicate check runs before the blob write, and the `(address, id)`
//! key of the meta row is what prevents paying the same submission twice.
//! Queue entries are deleted only after the transaction commits, so any
//! failure leaves the bulk to be redelivered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::sleep_or_cancelled;
use crate::error::{Error, Result};
use crate::models::PdvMessage;
use crate::services::blob_store::BlobStore;
use crate::services::chain::{Chain, RewardLine};
use crate::services::index::{Database, Index, Transaction, WindowLock};
use crate::services::queue::{Queue, QueueMessage};

/// Concurrent `process_one` calls within a bulk.
pub const INGEST_WORKERS: usize = 8;

/// Long-poll window of a single queue receive.
pub const POLL_WAIT: Duration = Duration::from_secs(60);

const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Meta already recorded; nothing to do but delete the entry
    Duplicate,
    /// Blob stored; meta still to be recorded
    Written,
    /// Left for redelivery
    Failed,
}

/// What one `process_bulk` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub received: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub written: usize,
    pub rewarded: usize,
    pub failed: usize,
    /// Hash of the reward transaction, if one was broadcast
    pub tx: Option<String>,
    pub deleted: usize,
}

pub struct PdvIngest {
    db: Arc<dyn Database>,
    blobs: Arc<BlobStore>,
    queue: Arc<dyn Queue>,
    chain: Arc<dyn Chain>,
    bulk_size: usize,
    poll_wait: Duration,
}

impl PdvIngest {
    pub fn new(
        db: Arc<dyn Database>,
        blobs: Arc<BlobStore>,
        queue: Arc<dyn Queue>,
        chain: Arc<dyn Chain>,
        bulk_size: usize,
    ) -> Self {
        Self {
            db,
            blobs,
            queue,
            chain,
            bulk_size,
            poll_wait: POLL_WAIT,
        }
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    /// Ingest one bulk. On error nothing is committed and nothing is
    /// deleted from the queue.
    pub async fn process_bulk(&self, messages: &[QueueMessage]) -> Result<BulkReport> {
        let mut report = BulkReport {
            received: messages.len(),
            ..Default::default()
        };

        // Decode, keeping one message per (address, id); later copies ride
        // along with the first and are deleted with it.
        let mut unique: Vec<PdvMessage> = Vec::with_capacity(messages.len());
        let mut receipts: Vec<Vec<String>> = Vec::with_capacity(messages.len());
        let mut positions: HashMap<(String, u64), usize> = HashMap::new();

        for message in messages {
            // Addresses are keyed in the chain's canonical form so that
            // account resets emitted by the chain find them.
            let decoded = match PdvMessage::decode(message.body.as_bytes()) {
                Ok(mut decoded) => match self.chain.normalize_address(&decoded.address) {
                    Some(address) => {
                        decoded.address = address;
                        decoded
                    }
                    None => {
                        warn!("Dropping message {}/{} with unpayable address", decoded.address, decoded.id);
                        report.malformed += 1;
                        continue;
                    }
                },
                Err(e) => {
                    warn!("Dropping malformed queue message: {}", e);
                    report.malformed += 1;
                    continue;
                }
            };

            let key = (decoded.address.clone(), decoded.id);
            match positions.get(&key) {
                Some(&pos) => receipts[pos].push(message.receipt.clone()),
                None => {
                    positions.insert(key, unique.len());
                    receipts.push(vec![message.receipt.clone()]);
                    unique.push(decoded);
                }
            }
        }

        let tx = self.db.begin().await?;
        let index: &dyn Transaction = &*tx;

        let pending: Vec<BoxFuture<'_, (usize, Outcome)>> = unique
            .iter()
            .enumerate()
            .map(|(pos, message)| self.process_one(index, message).map(move |outcome| (pos, outcome)).boxed())
            .collect();
        let outcomes: Vec<(usize, Outcome)> = stream::iter(pending)
        .buffer_unordered(INGEST_WORKERS)
        .collect()
        .await;

        let mut to_delete: Vec<String> = Vec::new();
        let mut written: Vec<&PdvMessage> = Vec::new();
        for (pos, outcome) in outcomes {
            match outcome {
                Outcome::Duplicate => {
                    report.duplicates += 1;
                    to_delete.extend(receipts[pos].iter().cloned());
                }
                Outcome::Written => {
                    report.written += 1;
                    to_delete.extend(receipts[pos].iter().cloned());
                    written.push(&unique[pos]);
                }
                Outcome::Failed => report.failed += 1,
            }
        }
        written.sort_by(|a, b| (&a.address, a.id).cmp(&(&b.address, b.id)));

        let (to_reward, rewardless): (Vec<&PdvMessage>, Vec<&PdvMessage>) =
            written.into_iter().partition(|m| m.is_rewardable());

        if !rewardless.is_empty() || !to_reward.is_empty() {
            tx.lock_rewards_window(WindowLock::Shared).await?;
        }

        for message in &rewardless {
            tx.set_pdv_meta(&message.address, message.id, "", &message.device, &message.meta)
                .await?;
        }

        if !to_reward.is_empty() {
            let lines: Vec<RewardLine> = to_reward
                .iter()
                .map(|m| RewardLine {
                    receiver: m.address.clone(),
                    reward: m.meta.reward,
                })
                .collect();
            let hash = self.chain.distribute_rewards(&lines).await?;

            // Last statements before commit.
            for message in &to_reward {
                tx.set_pdv_meta(&message.address, message.id, &hash, &message.device, &message.meta)
                    .await?;
            }
            report.rewarded = to_reward.len();
            report.tx = Some(hash);
        }

        if let Err(e) = tx.commit().await {
            if let Some(hash) = &report.tx {
                error!("Commit failed after reward broadcast {}: {}", hash, e);
            }
            return Err(e);
        }

        if !to_delete.is_empty() {
            match self.queue.delete(&to_delete).await {
                Ok(()) => report.deleted = to_delete.len(),
                Err(e) => warn!("Failed to delete {} processed queue messages: {}", to_delete.len(), e),
            }
        }

        Ok(report)
    }

    fn process_one<'a>(&'a self, index: &'a dyn Transaction, message: &'a PdvMessage) -> BoxFuture<'a, Outcome> {
        async move {
            match index.get_pdv_meta(&message.address, message.id).await {
                Ok(_) => {
                    debug!("Duplicate submission {}/{}", message.address, message.id);
                    Outcome::Duplicate
                }
                Err(Error::NotFound) => {
                    let size = message.data.len() as u64;
                    match self
                        .blobs
                        .write(&message.address, message.id, message.data.as_slice(), size)
                        .await
                    {
                        Ok(_) => Outcome::Written,
                        Err(e) => {
                            warn!("Failed to store pdv blob {}/{}: {}", message.address, message.id, e);
                            Outcome::Failed
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to look up pdv meta {}/{}: {}", message.address, message.id, e);
                    Outcome::Failed
                }
            }
        }
        .boxed()
    }
}

/// Start the PDV ingest job
///
/// Polls strictly sequentially: the next receive is issued only after the
/// previous bulk finished, so the queue itself buffers. A bulk in flight is
/// always completed before the job honours `shutdown`.
pub fn start_pdv_ingest_job(ingest: Arc<PdvIngest>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("PDV ingest job started with bulk size {}", ingest.bulk_size);

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = ingest.queue.receive(ingest.bulk_size, ingest.poll_wait) => received,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(e) => {
                    error!("Queue receive failed: {}", e);
                    if sleep_or_cancelled(RETRY_DELAY, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match ingest.process_bulk(&messages).await {
                Ok(report) if report.received == 0 => debug!("Empty bulk"),
                Ok(report) => info!(
                    "Processed pdv bulk: {} received, {} written, {} rewarded, {} duplicates, {} malformed, {} failed, tx {}",
                    report.received,
                    report.written,
                    report.rewarded,
                    report.duplicates,
                    report.malformed,
                    report.failed,
                    report.tx.as_deref().unwrap_or("-")
                ),
                Err(e) => error!("PDV bulk of {} failed, leaving it for redelivery: {}", messages.len(), e),
            }
        }

        info!("PDV ingest job stopped");
    })
}
