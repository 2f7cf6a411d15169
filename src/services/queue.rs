//! Durable submission queue.
//!
//! Received messages stay invisible for [`VISIBILITY_TIMEOUT`]; unless
//! deleted by receipt within that window they are redelivered.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::DeleteMessageBatchRequestEntry;
use aws_sdk_sqs::Client;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::{Error, Result};

pub const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest single long-poll SQS accepts.
const MAX_WAIT_PER_CALL: Duration = Duration::from_secs(20);

/// Most messages SQS returns from a receive or accepts in a batch delete.
const MAX_BATCH: usize = 10;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Handle that deletes this particular delivery
    pub receipt: String,
    pub body: String,
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Up to `max` messages, long-polling at most `wait` for the first one.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>>;

    /// Unknown or expired receipts are ignored.
    async fn delete(&self, receipts: &[String]) -> Result<()>;

    async fn send(&self, body: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    /// Resolve the queue URL by name. Fails fatally when the queue is missing.
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "cerberus-static",
        );

        let mut builder = aws_sdk_sqs::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone());
        }
        let client = Client::from_conf(builder.build());

        let output = tokio::time::timeout(
            CALL_TIMEOUT,
            client.get_queue_url().queue_name(&config.queue_name).send(),
        )
        .await?
        .map_err(|e| {
            Error::fatal(format!(
                "resolve queue {}: {}",
                config.queue_name,
                DisplayErrorContext(e)
            ))
        })?;

        let queue_url = output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| Error::fatal(format!("queue {} has no url", config.queue_name)))?;

        Ok(Self { client, queue_url })
    }

    async fn receive_once(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>> {
        let output = tokio::time::timeout(
            wait + CALL_TIMEOUT,
            self.client
                .receive_message()
                .queue_url(&self.queue_url)
                .max_number_of_messages(max.min(MAX_BATCH) as i32)
                .wait_time_seconds(wait.min(MAX_WAIT_PER_CALL).as_secs() as i32)
                .visibility_timeout(VISIBILITY_TIMEOUT.as_secs() as i32)
                .send(),
        )
        .await?
        .map_err(|e| sqs_err("receive", e))?;

        Ok(output
            .messages()
            .iter()
            .filter_map(|m| {
                Some(QueueMessage {
                    receipt: m.receipt_handle()?.to_string(),
                    body: m.body()?.to_string(),
                })
            })
            .collect())
    }
}

fn sqs_err(op: &str, e: impl std::error::Error) -> Error {
    Error::transient(format!("sqs {}: {}", op, DisplayErrorContext(e)))
}

#[async_trait]
impl Queue for SqsQueue {
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>> {
        let deadline = Instant::now() + wait;
        let mut messages = Vec::with_capacity(max);

        // Long-poll until something arrives, then top up without waiting.
        while messages.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            messages = self.receive_once(max, remaining).await?;
            if remaining.is_zero() {
                break;
            }
        }
        while !messages.is_empty() && messages.len() < max {
            let more = self
                .receive_once(max - messages.len(), Duration::ZERO)
                .await?;
            if more.is_empty() {
                break;
            }
            messages.extend(more);
        }

        debug!(count = messages.len(), "Received queue messages");
        Ok(messages)
    }

    async fn delete(&self, receipts: &[String]) -> Result<()> {
        for (batch_no, batch) in receipts.chunks(MAX_BATCH).enumerate() {
            let entries = batch
                .iter()
                .enumerate()
                .map(|(i, receipt)| {
                    DeleteMessageBatchRequestEntry::builder()
                        .id(format!("{}-{}", batch_no, i))
                        .receipt_handle(receipt)
                        .build()
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::invalid(format!("sqs delete request: {}", e)))?;

            let output = tokio::time::timeout(
                CALL_TIMEOUT,
                self.client
                    .delete_message_batch()
                    .queue_url(&self.queue_url)
                    .set_entries(Some(entries))
                    .send(),
            )
            .await?
            .map_err(|e| sqs_err("delete", e))?;

            for failed in output.failed() {
                warn!(
                    id = %failed.id(),
                    code = %failed.code(),
                    message = %failed.message().unwrap_or_default(),
                    "Queue message delete failed"
                );
            }
        }
        Ok(())
    }

    async fn send(&self, body: &str) -> Result<()> {
        tokio::time::timeout(
            CALL_TIMEOUT,
            self.client
                .send_message()
                .queue_url(&self.queue_url)
                .message_body(body)
                .send(),
        )
        .await?
        .map_err(|e| sqs_err("send", e))?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        tokio::time::timeout(
            CALL_TIMEOUT,
            self.client
                .get_queue_attributes()
                .queue_url(&self.queue_url)
                .send(),
        )
        .await?
        .map_err(|e| sqs_err("get attributes", e))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: String,
    visible_at: Instant,
    receipt: Option<String>,
}

/// In-process queue with visibility-timeout redelivery.
pub struct MemoryQueue {
    messages: Mutex<BTreeMap<u64, StoredMessage>>,
    next_seq: AtomicU64,
    next_receipt: AtomicU64,
    visibility: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_visibility(VISIBILITY_TIMEOUT)
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility(visibility: Duration) -> Self {
        Self {
            messages: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(0),
            next_receipt: AtomicU64::new(0),
            visibility,
        }
    }

    pub fn push(&self, body: impl Into<String>) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.messages.lock().insert(
            seq,
            StoredMessage {
                body: body.into(),
                visible_at: Instant::now(),
                receipt: None,
            },
        );
    }

    /// Messages not yet deleted, visible or not.
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bodies of messages not yet deleted, in enqueue order.
    pub fn bodies(&self) -> Vec<String> {
        self.messages.lock().values().map(|m| m.body.clone()).collect()
    }

    fn take_visible(&self, max: usize) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut messages = self.messages.lock();
        let mut taken = Vec::new();
        for stored in messages.values_mut() {
            if taken.len() >= max {
                break;
            }
            if stored.visible_at > now {
                continue;
            }
            let receipt = format!("r{}", self.next_receipt.fetch_add(1, Ordering::SeqCst));
            stored.visible_at = now + self.visibility;
            stored.receipt = Some(receipt.clone());
            taken.push(QueueMessage {
                receipt,
                body: stored.body.clone(),
            });
        }
        taken
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            let taken = self.take_visible(max);
            if !taken.is_empty() || Instant::now() >= deadline {
                return Ok(taken);
            }
            tokio::time::sleep(Duration::from_millis(20).min(wait)).await;
        }
    }

    async fn delete(&self, receipts: &[String]) -> Result<()> {
        self.messages
            .lock()
            .retain(|_, m| !m.receipt.as_ref().is_some_and(|r| receipts.contains(r)));
        Ok(())
    }

    async fn send(&self, body: &str) -> Result<()> {
        self.push(body);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_respects_max_and_delete() {
        let queue = MemoryQueue::new();
        for i in 0..3 {
            queue.push(format!("m{}", i));
        }

        let first = queue.receive(2, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].body, "m0");

        let receipts: Vec<String> = first.iter().map(|m| m.receipt.clone()).collect();
        queue.delete(&receipts).await.unwrap();
        assert_eq!(queue.bodies(), vec!["m2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undeleted_message_redelivers_after_visibility() {
        let queue = MemoryQueue::with_visibility(Duration::from_secs(10));
        queue.push("once");

        let first = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        let again = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_ne!(again[0].receipt, first[0].receipt);

        // A stale receipt no longer deletes the redelivered message.
        queue.delete(&[first[0].receipt.clone()]).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_waits_for_message() {
        let queue = std::sync::Arc::new(MemoryQueue::new());
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            producer.push("late");
        });

        let got = queue.receive(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.len(), 1);
    }
}
