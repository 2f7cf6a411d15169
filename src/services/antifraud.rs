//! Antifraud oracle: scores a submission with the reward it deserves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::PdvData;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait FraudOracle: Send + Sync {
    /// Reward in DEC; zero means the submission is not rewardable.
    async fn score(&self, address: &str, id: u64, data: &PdvData) -> Result<Decimal>;
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    address: &'a str,
    id: u64,
    data: &'a PdvData,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    reward: Decimal,
}

#[derive(Clone)]
pub struct AntifraudClient {
    client: Client,
    base_url: String,
}

impl AntifraudClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::fatal(format!("build antifraud client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl FraudOracle for AntifraudClient {
    async fn score(&self, address: &str, id: u64, data: &PdvData) -> Result<Decimal> {
        let url = format!("{}/score", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("accept", "application/json")
            .json(&ScoreRequest { address, id, data })
            .send()
            .await
            .map_err(|e| Error::transient(format!("antifraud request: {}", e)))?;

        let status = response.status();
        if status.is_client_error() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::invalid(format!("antifraud rejected {}: {}", status, error_text)));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::transient(format!("antifraud error {}: {}", status, error_text)));
        }

        let body: ScoreResponse = response
            .json()
            .await
            .map_err(|e| Error::transient(format!("antifraud response: {}", e)))?;

        debug!(address = %address, id = id, reward = %body.reward, "Scored submission");
        Ok(body.reward)
    }
}

/// Scores every submission with the same reward. Zero when no oracle is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticOracle(pub Decimal);

#[async_trait]
impl FraudOracle for StaticOracle {
    async fn score(&self, _address: &str, _id: u64, _data: &PdvData) -> Result<Decimal> {
        Ok(self.0)
    }
}

/// The configured oracle, or a zero-scoring one when `url` is unset.
pub fn oracle_from_url(url: Option<&str>) -> Result<Arc<dyn FraudOracle>> {
    match url {
        Some(url) => Ok(Arc::new(AntifraudClient::new(url)?)),
        None => Ok(Arc::new(StaticOracle::default())),
    }
}
