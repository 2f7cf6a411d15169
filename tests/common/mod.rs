#![allow(dead_code)]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use cerberus::jobs::{chain_tail::ChainTail, pdv_ingest::PdvIngest, rewards_distribution::RewardsDistributor};
use cerberus::models::{PdvMessage, PdvMessageMeta};
use cerberus::services::{
    blob_store::BlobStore,
    chain::MemoryChain,
    dare::DareKey,
    index::{MemoryIndex, SeaIndex},
    object_store::MemoryObjectStore,
    profile_cache::ProfileCache,
    queue::{MemoryQueue, Queue, QueueMessage},
};
use cerberus::config::DbConfig;
use rust_decimal::Decimal;

pub const MEMO: &str = "PDV rewards";

/// Every pipeline dependency wired to its in-memory implementation.
pub struct Harness {
    pub index: Arc<MemoryIndex>,
    pub objects: Arc<MemoryObjectStore>,
    pub blobs: Arc<BlobStore>,
    pub queue: Arc<MemoryQueue>,
    pub chain: Arc<MemoryChain>,
    pub profiles: ProfileCache,
}

impl Harness {
    pub fn new() -> Self {
        let index = Arc::new(MemoryIndex::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let blobs = Arc::new(BlobStore::new(objects.clone(), test_key()));
        let profiles = ProfileCache::new(index.clone());

        Self {
            index,
            objects,
            blobs,
            queue: Arc::new(MemoryQueue::new()),
            chain: Arc::new(MemoryChain::new()),
            profiles,
        }
    }

    pub fn ingest(&self, bulk_size: usize) -> PdvIngest {
        PdvIngest::new(
            self.index.clone(),
            self.blobs.clone(),
            self.queue.clone(),
            self.chain.clone(),
            bulk_size,
        )
        .with_poll_wait(Duration::from_millis(50))
    }

    pub fn distributor(&self, pool_size: u64, interval: Duration) -> RewardsDistributor {
        RewardsDistributor::new(self.index.clone(), self.chain.clone(), pool_size, interval, MEMO)
    }

    pub fn chain_tail(&self) -> ChainTail {
        ChainTail::new(
            self.index.clone(),
            self.blobs.clone(),
            self.chain.clone(),
            self.profiles.clone(),
        )
    }

    /// Enqueue `message` and return its queue body.
    pub fn enqueue(&self, message: &PdvMessage) -> String {
        let body = message.encode().unwrap();
        self.queue.push(body.clone());
        body
    }

    /// Everything currently visible on the queue.
    pub async fn receive_all(&self) -> Vec<QueueMessage> {
        self.queue.receive(100, Duration::ZERO).await.unwrap()
    }
}

pub fn test_key() -> DareKey {
    DareKey::new([0x42; 32])
}

pub fn pdv_message(address: &str, id: u64, reward: Decimal) -> PdvMessage {
    PdvMessage {
        id,
        address: address.to_string(),
        device: "device-1".to_string(),
        meta: PdvMessageMeta {
            object_types: [("cookie".to_string(), 1)].into_iter().collect(),
            reward,
        },
        data: pdv_data(address, id),
    }
}

pub fn pdv_data(address: &str, id: u64) -> Vec<u8> {
    format!(
        r#"{{"version":"v1","pdv":[{{"type":"cookie","name":"session","value":"{}-{}","domain":"example.com"}}]}}"#,
        address, id
    )
    .into_bytes()
}

pub fn meta(reward: Decimal) -> PdvMessageMeta {
    PdvMessageMeta {
        object_types: Default::default(),
        reward,
    }
}

/// Set up a Postgres-backed index
/// Uses TEST_DATABASE_URL environment variable or falls back to default
pub async fn setup_test_db() -> cerberus::Result<SeaIndex> {
    let dsn = env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://cerberus@localhost:5432/cerberus_test".to_string());

    let index = SeaIndex::connect(&DbConfig {
        dsn,
        max_open_conns: 5,
        max_idle_conns: 1,
    })
    .await?;
    index.migrate().await?;
    Ok(index)
}
