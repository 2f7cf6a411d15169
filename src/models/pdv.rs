use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fractional digits carried by rewards on the wire and in `pdv.reward`.
pub const REWARD_SCALE: u32 = 18;

/// Exclusive upper bound of a reward; `NUMERIC(24,18)` leaves six integer digits.
const REWARD_LIMIT: i64 = 1_000_000;

/// A signed submission as it travels through the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdvMessage {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Device", default)]
    pub device: String,
    #[serde(rename = "Meta")]
    pub meta: PdvMessageMeta,
    #[serde(rename = "Data", with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PdvMessageMeta {
    /// Number of data items per object type, e.g. `{"cookie": 2}`
    #[serde(default)]
    pub object_types: BTreeMap<String, u16>,
    /// Reward in DEC as scored by the antifraud oracle; zero means non-rewardable
    #[serde(with = "reward_decimal")]
    pub reward: Decimal,
}

impl PdvMessage {
    /// Decode and validate a queue body. Unknown fields are ignored.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let message: PdvMessage = serde_json::from_slice(body)
            .map_err(|e| Error::invalid(format!("malformed pdv message: {}", e)))?;
        message.validate()?;
        Ok(message)
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::invalid(format!("encode pdv message: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::invalid("empty address"));
        }
        if self.address.contains('/') {
            return Err(Error::invalid("address must not contain '/'"));
        }
        if self.id > i64::MAX as u64 {
            return Err(Error::invalid(format!("id {} out of range", self.id)));
        }
        validate_reward(self.meta.reward)
    }

    pub fn is_rewardable(&self) -> bool {
        self.meta.reward > Decimal::ZERO
    }
}

pub fn validate_reward(reward: Decimal) -> Result<()> {
    if reward.is_sign_negative() && !reward.is_zero() {
        return Err(Error::invalid("negative reward"));
    }
    if reward.scale() > REWARD_SCALE {
        return Err(Error::invalid(format!(
            "reward {} has more than {} fractional digits",
            reward, REWARD_SCALE
        )));
    }
    if reward >= Decimal::from(REWARD_LIMIT) {
        return Err(Error::invalid(format!("reward {} out of range", reward)));
    }
    Ok(())
}

/// Persisted projection of an ingested submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdvMeta {
    pub address: String,
    pub id: u64,
    /// Broadcast transaction hash; empty when the submission carried no reward
    pub tx: String,
    pub device: String,
    #[serde(with = "reward_decimal")]
    pub reward: Decimal,
    pub object_types: BTreeMap<String, u16>,
    pub created_at: DateTime<Utc>,
}

/// `Data` travels as standard base64.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = <Option<String>>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Rewards are written as fixed-scale strings, e.g. `"0.000001000000000000"`.
pub mod reward_decimal {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::REWARD_SCALE;

    pub fn format(reward: &Decimal) -> String {
        let mut scaled = *reward;
        scaled.rescale(REWARD_SCALE);
        scaled.to_string()
    }

    pub fn serialize<S: Serializer>(reward: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(reward))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
        <Decimal as Deserialize>::deserialize(deserializer)
    }
}
