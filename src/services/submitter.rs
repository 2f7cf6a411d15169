//! Enqueue side of ingest: validate, score and queue a signed submission.

use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::models::pdv::validate_reward;
use crate::models::{PdvData, PdvMessage, PdvMessageMeta};
use crate::services::antifraud::FraudOracle;
use crate::services::queue::Queue;

/// Largest accepted `Data` payload.
pub const MAX_DATA_SIZE: usize = 8 * 1024 * 1024;

pub struct PdvSubmitter {
    queue: Arc<dyn Queue>,
    oracle: Arc<dyn FraudOracle>,
}

impl PdvSubmitter {
    pub fn new(queue: Arc<dyn Queue>, oracle: Arc<dyn FraudOracle>) -> Self {
        Self { queue, oracle }
    }

    /// Returns the queued message. `Invalid` for schema or oracle rejections.
    pub async fn submit(&self, address: &str, id: u64, device: &str, data: Vec<u8>) -> Result<PdvMessage> {
        if data.len() > MAX_DATA_SIZE {
            return Err(Error::invalid(format!("pdv data exceeds {} bytes", MAX_DATA_SIZE)));
        }
        let parsed = PdvData::parse(&data)?;

        let reward = self.oracle.score(address, id, &parsed).await?;
        validate_reward(reward)?;

        let message = PdvMessage {
            id,
            address: address.to_string(),
            device: device.to_string(),
            meta: PdvMessageMeta {
                object_types: parsed.object_types(),
                reward,
            },
            data,
        };
        message.validate()?;

        self.queue.send(&message.encode()?).await?;
        info!(address = %address, id = id, reward = %reward, "Queued pdv submission");
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::antifraud::StaticOracle;
    use crate::services::queue::MemoryQueue;
    use rust_decimal_macros::dec;

    const DATA: &str = r#"{"version":"v1","pdv":[{"type":"cookie","name":"a","value":"1","domain":"d"},{"type":"cookie","name":"b","value":"2","domain":"d"}]}"#;

    #[tokio::test]
    async fn test_submit_queues_scored_message() {
        let queue = Arc::new(MemoryQueue::new());
        let submitter = PdvSubmitter::new(queue.clone(), Arc::new(StaticOracle(dec!(0.000002))));

        submitter.submit("addrX", 2, "ios", DATA.as_bytes().to_vec()).await.unwrap();

        let bodies = queue.bodies();
        assert_eq!(bodies.len(), 1);
        let queued = PdvMessage::decode(bodies[0].as_bytes()).unwrap();
        assert_eq!(queued.meta.reward, dec!(0.000002));
        assert_eq!(queued.meta.object_types["cookie"], 2);
        assert_eq!(queued.data, DATA.as_bytes());
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_payload() {
        let queue = Arc::new(MemoryQueue::new());
        let submitter = PdvSubmitter::new(queue.clone(), Arc::new(StaticOracle::default()));

        let err = submitter.submit("addrX", 1, "", b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_negative_score() {
        let queue = Arc::new(MemoryQueue::new());
        let submitter = PdvSubmitter::new(queue.clone(), Arc::new(StaticOracle(dec!(-1))));

        assert!(submitter.submit("addrX", 1, "", DATA.as_bytes().to_vec()).await.is_err());
        assert!(queue.is_empty());
    }
}
