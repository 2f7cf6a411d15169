//! EVM rewards contract client.
//!
//! Broadcasts are serialised behind one async mutex that also guards the
//! cached account nonce. The nonce is read from the node lazily and re-read
//! when the node reports a mismatch, after which the broadcast is retried once.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use alloy::{
    eips::BlockNumberOrTag,
    network::{EthereumWallet, TransactionBuilder},
    primitives::{Address, Bytes, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::{Filter, TransactionRequest},
    signers::local::PrivateKeySigner,
    sol,
    sol_types::{SolCall, SolEvent},
    transports::http::{Client, Http},
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Block, BlockMessage, Chain, RewardLine, StakeLine};
use crate::config::{BlockchainConfig, BroadcastMode, KeyringBackend};
use crate::error::{Error, Result};
use crate::models::pdv::REWARD_SCALE;

sol! {
    interface IPdvRewards {
        function distributeRewards(address[] receivers, uint256[] rewards) external;
        function sendStakes(address[] receivers, uint256[] amounts, string memo) external;
        event AccountReset(address indexed owner);
    }
}

const RPC_TIMEOUT: Duration = Duration::from_secs(5);
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Wei per uDEC.
const WEI_PER_UDEC: u64 = 1_000_000_000_000;

pub struct EvmChain {
    provider: RootProvider<Http<Client>>,
    node_url: reqwest::Url,
    wallet: EthereumWallet,
    sender: Address,
    contract: Address,
    chain_id: u64,
    gas: u64,
    gas_adjust: f64,
    fees: u128,
    broadcast_mode: BroadcastMode,
    /// Next nonce to use; `None` until read from the node
    nonce: Mutex<Option<u64>>,
}

impl EvmChain {
    pub fn new(config: &BlockchainConfig) -> Result<Self> {
        let node_url: reqwest::Url = config
            .node_uri
            .parse()
            .map_err(|e| Error::fatal(format!("BLOCKCHAIN_NODE_URI: {}", e)))?;
        let contract = Address::from_str(&config.rewards_contract)
            .map_err(|e| Error::fatal(format!("BLOCKCHAIN_REWARDS_CONTRACT: {}", e)))?;

        let signer = load_signer(config)?;
        let sender = signer.address();

        info!(
            sender = %sender,
            contract = %contract,
            chain_id = config.chain_id,
            "Initialized blockchain client"
        );

        Ok(Self {
            provider: ProviderBuilder::new().on_http(node_url.clone()),
            node_url,
            wallet: EthereumWallet::from(signer),
            sender,
            contract,
            chain_id: config.chain_id,
            gas: config.gas,
            gas_adjust: config.gas_adjust,
            fees: config.fees,
            broadcast_mode: config.broadcast_mode,
            nonce: Mutex::new(None),
        })
    }

    async fn broadcast(&self, input: Vec<u8>, kind: &str) -> Result<String> {
        let mut nonce = self.nonce.lock().await;

        let mut refreshed = false;
        loop {
            let current = match *nonce {
                Some(n) => n,
                None => {
                    refreshed = true;
                    self.fetch_nonce().await?
                }
            };

            match self.send(input.clone(), current).await {
                Ok(hash) => {
                    *nonce = Some(current + 1);
                    info!(kind = %kind, tx = %hash, nonce = current, "Broadcast transaction");
                    return Ok(hash);
                }
                Err(e) if is_nonce_mismatch(&e) && !refreshed => {
                    warn!(kind = %kind, nonce = current, error = %e, "Nonce mismatch, refreshing");
                    *nonce = None;
                }
                Err(e) => {
                    if is_nonce_mismatch(&e) {
                        *nonce = None;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_nonce(&self) -> Result<u64> {
        let nonce = tokio::time::timeout(RPC_TIMEOUT, self.provider.get_transaction_count(self.sender))
            .await?
            .map_err(|e| rpc_err("get nonce", e))?;
        debug!(nonce = nonce, "Fetched account nonce");
        Ok(nonce)
    }

    async fn send(&self, input: Vec<u8>, nonce: u64) -> Result<String> {
        let mut tx = TransactionRequest::default()
            .with_from(self.sender)
            .with_to(self.contract)
            .with_input(Bytes::from(input))
            .with_nonce(nonce)
            .with_chain_id(self.chain_id);

        let gas_limit = if self.gas > 0 {
            self.gas
        } else {
            let estimate = tokio::time::timeout(RPC_TIMEOUT, self.provider.estimate_gas(&tx))
                .await?
                .map_err(|e| rpc_err("estimate gas", e))?;
            (estimate as f64 * self.gas_adjust).ceil() as u64
        };
        let gas_price = if self.fees > 0 {
            self.fees
        } else {
            tokio::time::timeout(RPC_TIMEOUT, self.provider.get_gas_price())
                .await?
                .map_err(|e| rpc_err("gas price", e))?
        };
        tx = tx.with_gas_limit(gas_limit).with_gas_price(gas_price);

        let signing = ProviderBuilder::new()
            .wallet(self.wallet.clone())
            .on_http(self.node_url.clone());

        let pending = tokio::time::timeout(RPC_TIMEOUT, signing.send_transaction(tx))
            .await?
            .map_err(|e| rpc_err("send transaction", e))?;
        let hash = format!("{:#x}", pending.tx_hash());

        if self.broadcast_mode == BroadcastMode::Block {
            let receipt = tokio::time::timeout(RECEIPT_TIMEOUT, pending.get_receipt())
                .await?
                .map_err(|e| rpc_err("transaction receipt", e))?;
            if !receipt.status() {
                return Err(Error::transient(format!("transaction {} reverted", hash)));
            }
        }
        Ok(hash)
    }
}

fn load_signer(config: &BlockchainConfig) -> Result<PrivateKeySigner> {
    let path = Path::new(&config.keyring_home).join(&config.from_key_name);
    match config.keyring_backend {
        KeyringBackend::Test => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| Error::fatal(format!("read key {}: {}", path.display(), e)))?;
            raw.trim()
                .parse::<PrivateKeySigner>()
                .map_err(|e| Error::fatal(format!("parse key {}: {}", path.display(), e)))
        }
        KeyringBackend::Keystore => {
            PrivateKeySigner::decrypt_keystore(&path, &config.keyring_prompt_input)
                .map_err(|e| Error::fatal(format!("unlock keystore {}: {}", path.display(), e)))
        }
    }
}

fn rpc_err(op: &str, e: impl std::fmt::Display) -> Error {
    Error::transient(format!("rpc {}: {}", op, e))
}

fn is_nonce_mismatch(err: &Error) -> bool {
    let Error::Transient(msg) = err else {
        return false;
    };
    let msg = msg.to_ascii_lowercase();
    ["nonce too low", "nonce too high", "invalid nonce", "sequence mismatch"]
        .iter()
        .any(|needle| msg.contains(needle))
}

fn parse_address(address: &str) -> Result<Address> {
    Address::from_str(address).map_err(|e| Error::invalid(format!("address {}: {}", address, e)))
}

/// Lowercase `0x` hex; the form owners are stored and reset under.
pub fn canonical_address(address: &Address) -> String {
    format!("{:#x}", address)
}

/// Any accepted spelling of an address (checksummed or not) in canonical form.
pub fn normalize_address(address: &str) -> Option<String> {
    parse_address(address).ok().map(|address| canonical_address(&address))
}

/// DEC amount in the contract's 18-decimal base unit.
pub fn dec_to_base_units(reward: Decimal) -> Result<U256> {
    if reward.is_sign_negative() && !reward.is_zero() {
        return Err(Error::invalid(format!("negative reward {}", reward)));
    }
    if reward.scale() > REWARD_SCALE {
        return Err(Error::invalid(format!("reward {} exceeds 18 decimals", reward)));
    }
    let mut scaled = reward;
    scaled.rescale(REWARD_SCALE);
    Ok(U256::from(scaled.mantissa().unsigned_abs()))
}

/// uDEC amount in the contract's 18-decimal base unit.
pub fn udec_to_base_units(amount: u64) -> U256 {
    U256::from(amount) * U256::from(WEI_PER_UDEC)
}

pub fn encode_distribute_rewards(rewards: &[RewardLine]) -> Result<Vec<u8>> {
    let mut receivers = Vec::with_capacity(rewards.len());
    let mut amounts = Vec::with_capacity(rewards.len());
    for line in rewards {
        receivers.push(parse_address(&line.receiver)?);
        amounts.push(dec_to_base_units(line.reward)?);
    }
    Ok(IPdvRewards::distributeRewardsCall {
        receivers,
        rewards: amounts,
    }
    .abi_encode())
}

pub fn encode_send_stakes(stakes: &[StakeLine], memo: &str) -> Result<Vec<u8>> {
    let mut receivers = Vec::with_capacity(stakes.len());
    let mut amounts = Vec::with_capacity(stakes.len());
    for line in stakes {
        receivers.push(parse_address(&line.address)?);
        amounts.push(udec_to_base_units(line.amount));
    }
    Ok(IPdvRewards::sendStakesCall {
        receivers,
        amounts,
        memo: memo.to_string(),
    }
    .abi_encode())
}

#[async_trait]
impl Chain for EvmChain {
    async fn distribute_rewards(&self, rewards: &[RewardLine]) -> Result<String> {
        if rewards.is_empty() {
            return Err(Error::invalid("distribute rewards without receivers"));
        }
        let input = encode_distribute_rewards(rewards)?;
        self.broadcast(input, "distribute_rewards").await
    }

    async fn send_stakes(&self, stakes: &[StakeLine], memo: &str) -> Result<String> {
        if stakes.is_empty() {
            return Err(Error::invalid("send stakes without receivers"));
        }
        let input = encode_send_stakes(stakes, memo)?;
        self.broadcast(input, "send_stakes").await
    }

    async fn block(&self, height: u64) -> Result<Option<Block>> {
        let latest = tokio::time::timeout(RPC_TIMEOUT, self.provider.get_block_number())
            .await?
            .map_err(|e| rpc_err("block number", e))?;
        if height > latest {
            return Ok(None);
        }

        let filter = Filter::new()
            .address(self.contract)
            .event_signature(IPdvRewards::AccountReset::SIGNATURE_HASH)
            .from_block(BlockNumberOrTag::Number(height))
            .to_block(BlockNumberOrTag::Number(height));

        let logs = tokio::time::timeout(RPC_TIMEOUT, self.provider.get_logs(&filter))
            .await?
            .map_err(|e| rpc_err("get logs", e))?;

        let mut messages = Vec::with_capacity(logs.len());
        for log in &logs {
            // topic[0] = event signature, topic[1] = owner (indexed address)
            let topics = log.inner.topics();
            if topics.len() < 2 {
                warn!(height = height, "AccountReset log with insufficient topics, skipping");
                messages.push(BlockMessage::Other {
                    kind: "malformed AccountReset".to_string(),
                });
                continue;
            }
            let owner = Address::from_slice(&topics[1][12..32]);
            messages.push(BlockMessage::ResetAccount {
                owner: canonical_address(&owner),
            });
        }

        Ok(Some(Block { height, messages }))
    }

    fn normalize_address(&self, address: &str) -> Option<String> {
        normalize_address(address)
    }

    async fn ping(&self) -> Result<()> {
        tokio::time::timeout(RPC_TIMEOUT, self.provider.get_block_number())
            .await?
            .map_err(|e| rpc_err("block number", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const ADDR: &str = "0x00000000000000000000000000000000000000aa";

    #[test]
    fn test_dec_to_base_units() {
        assert_eq!(
            dec_to_base_units(dec!(0.000002)).unwrap(),
            U256::from(2_000_000_000_000u64)
        );
        assert_eq!(
            dec_to_base_units(dec!(1)).unwrap(),
            U256::from(1_000_000_000_000_000_000u64)
        );
        assert!(dec_to_base_units(dec!(-1)).is_err());
    }

    #[test]
    fn test_udec_to_base_units() {
        assert_eq!(udec_to_base_units(1), U256::from(WEI_PER_UDEC));
        assert_eq!(
            udec_to_base_units(600),
            dec_to_base_units(dec!(0.0006)).unwrap()
        );
    }

    #[test]
    fn test_encode_send_stakes_decodes() {
        let input = encode_send_stakes(
            &[StakeLine {
                address: ADDR.to_string(),
                amount: 5,
            }],
            "PDV rewards",
        )
        .unwrap();

        let call = IPdvRewards::sendStakesCall::abi_decode(&input, true).unwrap();
        assert_eq!(call.receivers, vec![Address::from_str(ADDR).unwrap()]);
        assert_eq!(call.amounts, vec![U256::from(5 * WEI_PER_UDEC)]);
        assert_eq!(call.memo, "PDV rewards");
    }

    #[test]
    fn test_encode_rejects_bad_receiver() {
        let lines = [RewardLine {
            receiver: "addrX".to_string(),
            reward: dec!(1),
        }];
        assert!(matches!(encode_distribute_rewards(&lines), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_checksummed_address_matches_reset_owner() {
        let checksummed = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

        // Owner as decoded from an indexed AccountReset topic
        let topic = Address::from_str(checksummed).unwrap().into_word();
        let owner = canonical_address(&Address::from_slice(&topic[12..32]));

        let normalized = normalize_address(checksummed).unwrap();
        assert_eq!(normalized, "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed");
        assert_eq!(normalized, owner);
        assert_eq!(normalize_address(&normalized), Some(normalized.clone()));

        assert_eq!(normalize_address("addrX"), None);
        assert_eq!(normalize_address(""), None);
    }

    #[test]
    fn test_nonce_mismatch_detection() {
        assert!(is_nonce_mismatch(&Error::transient("rpc send transaction: nonce too low")));
        assert!(is_nonce_mismatch(&Error::transient("account sequence mismatch, expected 4")));
        assert!(!is_nonce_mismatch(&Error::transient("connection refused")));
        assert!(!is_nonce_mismatch(&Error::invalid("nonce too low")));
    }
}
