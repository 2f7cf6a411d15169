//! Process configuration, read from the environment (optionally seeded from `.env`).

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub object_storage: ObjectStorageConfig,
    pub queue: QueueConfig,
    pub db: DbConfig,
    pub blockchain: BlockchainConfig,
    pub rewards: RewardsConfig,
    /// 64 hex characters
    pub encrypt_key: String,
    pub antifraud_url: Option<String>,
    pub sentry_dsn: Option<String>,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub max_body_size: usize,
}

#[derive(Debug, Clone)]
pub struct ObjectStorageConfig {
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub use_ssl: bool,
    pub bucket: String,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub queue_name: String,
    pub bulk_size: usize,
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub dsn: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyringBackend {
    /// Plain hex private key file
    Test,
    /// Encrypted JSON keystore, unlocked with the prompt input
    Keystore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    /// Return once the node accepted the transaction
    Sync,
    /// Wait for inclusion and fail on revert
    Block,
}

#[derive(Debug, Clone)]
pub struct BlockchainConfig {
    pub node_uri: String,
    pub chain_id: u64,
    pub rewards_contract: String,
    pub from_key_name: String,
    pub keyring_backend: KeyringBackend,
    pub keyring_home: String,
    pub keyring_prompt_input: String,
    pub tx_memo: String,
    /// Gas limit; 0 lets the node estimate
    pub gas: u64,
    pub gas_adjust: f64,
    /// Max fee per gas in wei; 0 uses the node's suggestion
    pub fees: u128,
    pub broadcast_mode: BroadcastMode,
}

#[derive(Debug, Clone)]
pub struct RewardsConfig {
    /// uDEC distributed per window
    pub pool_size: u64,
    pub interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        Self::from_lookup(|name| vars.get(name).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        Ok(Self {
            http: HttpConfig {
                host: env.or("HTTP_HOST", "0.0.0.0"),
                port: env.parse_or("HTTP_PORT", 8080)?,
                max_body_size: env.parse_or("HTTP_MAX_BODY_SIZE", 8 * 1024 * 1024)?,
            },
            object_storage: ObjectStorageConfig {
                endpoint: env.or("OBJECT_STORAGE_ENDPOINT", ""),
                region: env.or("OBJECT_STORAGE_REGION", "us-east-1"),
                access_key_id: env.or("OBJECT_STORAGE_ACCESS_KEY_ID", ""),
                secret_access_key: env.or("OBJECT_STORAGE_SECRET_ACCESS_KEY", ""),
                use_ssl: env.parse_or("OBJECT_STORAGE_USE_SSL", true)?,
                bucket: env.required("OBJECT_STORAGE_BUCKET")?,
            },
            queue: QueueConfig {
                region: env.or("QUEUE_REGION", "us-east-1"),
                endpoint: env.optional("QUEUE_ENDPOINT"),
                access_key_id: env.or("QUEUE_ACCESS_KEY_ID", ""),
                secret_access_key: env.or("QUEUE_SECRET_ACCESS_KEY", ""),
                queue_name: env.required("QUEUE_NAME")?,
                bulk_size: env.parse_or("QUEUE_BULK_SIZE", 10)?,
            },
            db: DbConfig {
                dsn: env.required("DATABASE_URL")?,
                max_open_conns: env.parse_or("DB_MAX_OPEN_CONNS", 20)?,
                max_idle_conns: env.parse_or("DB_MAX_IDLE_CONNS", 5)?,
            },
            blockchain: BlockchainConfig {
                node_uri: env.required("BLOCKCHAIN_NODE_URI")?,
                chain_id: env.parse_required("BLOCKCHAIN_CHAIN_ID")?,
                rewards_contract: env.required("BLOCKCHAIN_REWARDS_CONTRACT")?,
                from_key_name: env.or("BLOCKCHAIN_FROM_KEY_NAME", "cerberus"),
                keyring_backend: match env.or("BLOCKCHAIN_KEYRING_BACKEND", "test").as_str() {
                    "test" => KeyringBackend::Test,
                    "keystore" => KeyringBackend::Keystore,
                    other => {
                        return Err(Error::fatal(format!(
                            "BLOCKCHAIN_KEYRING_BACKEND: unknown backend {:?}",
                            other
                        )))
                    }
                },
                keyring_home: env.or("BLOCKCHAIN_KEYRING_HOME", "./keyring"),
                keyring_prompt_input: env.or("BLOCKCHAIN_KEYRING_PROMPT_INPUT", ""),
                tx_memo: env.or("BLOCKCHAIN_TX_MEMO", "PDV rewards"),
                gas: env.parse_or("BLOCKCHAIN_GAS", 0)?,
                gas_adjust: env.parse_or("BLOCKCHAIN_GAS_ADJUST", 1.0)?,
                fees: env.parse_or("BLOCKCHAIN_FEES", 0)?,
                broadcast_mode: match env.or("BLOCKCHAIN_BROADCAST_MODE", "sync").as_str() {
                    "sync" | "async" => BroadcastMode::Sync,
                    "block" => BroadcastMode::Block,
                    other => {
                        return Err(Error::fatal(format!(
                            "BLOCKCHAIN_BROADCAST_MODE: unknown mode {:?}",
                            other
                        )))
                    }
                },
            },
            rewards: RewardsConfig {
                pool_size: env.parse_required("REWARDS_POOL_SIZE")?,
                interval: parse_duration(&env.or("REWARDS_INTERVAL", "720h"))
                    .map_err(|e| Error::fatal(format!("REWARDS_INTERVAL: {}", e)))?,
            },
            encrypt_key: env.required("ENCRYPT_KEY")?,
            antifraud_url: env.optional("ANTIFRAUD_URL"),
            sentry_dsn: env.optional("SENTRY_DSN"),
            log_level: env.or("LOG_LEVEL", "info"),
        })
        .and_then(Config::validate)
    }

    fn validate(self) -> Result<Self> {
        if self.queue.bulk_size == 0 {
            return Err(Error::fatal("QUEUE_BULK_SIZE must be positive"));
        }
        if self.rewards.pool_size == 0 {
            return Err(Error::fatal("REWARDS_POOL_SIZE must be positive"));
        }
        if self.rewards.interval.is_zero() {
            return Err(Error::fatal("REWARDS_INTERVAL must be positive"));
        }
        if !(self.blockchain.gas_adjust.is_finite() && self.blockchain.gas_adjust >= 1.0) {
            return Err(Error::fatal("BLOCKCHAIN_GAS_ADJUST must be >= 1.0"));
        }
        Ok(self)
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn or(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.optional(name)
            .ok_or_else(|| Error::fatal(format!("{} must be set", name)))
    }

    fn parse_or<T: FromStr>(&self, name: &str, default: T) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            Some(raw) => parse_var(name, &raw),
            None => Ok(default),
        }
    }

    fn parse_required<T: FromStr>(&self, name: &str) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        parse_var(name, &self.required(name)?)
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::fatal(format!("{}: invalid value {:?}: {}", name, raw, e)))
}

/// Parse `90s`, `10m`, `720h`, `30d` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {:?}", raw))?;
    let secs = match unit {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => return Err(format!("unknown duration unit {:?}", unit)),
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> HashMap<String, String> {
        [
            ("OBJECT_STORAGE_BUCKET", "pdv"),
            ("QUEUE_NAME", "pdv-ingest"),
            ("DATABASE_URL", "postgres://localhost/cerberus"),
            ("BLOCKCHAIN_NODE_URI", "http://localhost:8545"),
            ("BLOCKCHAIN_CHAIN_ID", "202020"),
            ("BLOCKCHAIN_REWARDS_CONTRACT", "0x0000000000000000000000000000000000000001"),
            ("REWARDS_POOL_SIZE", "1000000000"),
            ("ENCRYPT_KEY", "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_map(&base()).unwrap();

        assert_eq!(config.http.port, 8080);
        assert_eq!(config.queue.bulk_size, 10);
        assert_eq!(config.rewards.interval, Duration::from_secs(30 * 86400));
        assert_eq!(config.blockchain.tx_memo, "PDV rewards");
        assert_eq!(config.blockchain.broadcast_mode, BroadcastMode::Sync);
        assert_eq!(config.blockchain.keyring_backend, KeyringBackend::Test);
        assert!(config.object_storage.use_ssl);
        assert!(config.antifraud_url.is_none());
    }

    #[test]
    fn test_missing_required_is_fatal() {
        let mut vars = base();
        vars.remove("DATABASE_URL");
        let err = Config::from_map(&vars).unwrap_err();
        assert!(matches!(err, Error::Fatal(msg) if msg.contains("DATABASE_URL")));
    }

    #[test]
    fn test_invalid_number_is_fatal() {
        let mut vars = base();
        vars.insert("HTTP_PORT".to_string(), "eighty".to_string());
        assert!(matches!(Config::from_map(&vars), Err(Error::Fatal(_))));

        let mut vars = base();
        vars.insert("QUEUE_BULK_SIZE".to_string(), "0".to_string());
        assert!(matches!(Config::from_map(&vars), Err(Error::Fatal(_))));
    }

    #[test]
    fn test_overrides() {
        let mut vars = base();
        vars.insert("BLOCKCHAIN_BROADCAST_MODE".to_string(), "block".to_string());
        vars.insert("BLOCKCHAIN_KEYRING_BACKEND".to_string(), "keystore".to_string());
        vars.insert("REWARDS_INTERVAL".to_string(), "10m".to_string());
        vars.insert("OBJECT_STORAGE_USE_SSL".to_string(), "false".to_string());

        let config = Config::from_map(&vars).unwrap();
        assert_eq!(config.blockchain.broadcast_mode, BroadcastMode::Block);
        assert_eq!(config.blockchain.keyring_backend, KeyringBackend::Keystore);
        assert_eq!(config.rewards.interval, Duration::from_secs(600));
        assert!(!config.object_storage.use_ssl);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("5w").is_err());
    }
}
