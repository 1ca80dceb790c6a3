//! Shared test helpers and utilities.
//!
//! In-memory stand-ins for the chain, the ABI explorer and the AVS contract
//! reads, plus factories for blocks, receipts and protocol logs.

#![allow(dead_code)]

use alloy::hex;
use alloy::primitives::{keccak256, U256};
use async_trait::async_trait;
use eyre::{eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sidecar_data::abi_source::{AbiSource, AbiSourceError};
use sidecar_data::chain::{ChainGateway, EthereumBlock, EthereumLog, EthereumReceipt, EthereumTransaction};
use sidecar_data::config::{Chain, Config};
use sidecar_data::contract_caller::ContractCaller;
use sidecar_data::store::Store;
use sidecar_index::Pipeline;

pub const SENDER: &str = "0x3449fe2810b0a5f6dffc62b8b6ee6b732dfe4438";
pub const EARNER: &str = "0x3449fe2810b0a5f6dffc62b8b6ee6b732dfe4438";
pub const TOKEN: &str = "0x127500cd2030577f66d1b79600d30dcdba2ed32d";
pub const CLAIM_ROOT: &str = "0xc8c25eab0ce7b95a353257ceb33ec28b5c349f2aa5eaf902b44d9bca51e564bc";
pub const CLAIMED_AMOUNT: &str = "306564275428435710000000";
pub const OPERATOR: &str = "0x5accc90436492f24e6af278569691e2c942a676d";
pub const AVS: &str = "0x870679e138bcdf293b7ff14dd44b70fc97e12fc0";
pub const STRATEGY: &str = "0x93c4b944d05dfe6df7645a86cd2206016c51564d";
pub const UNRELATED: &str = "0x00000000219ab540356cbb839cbe05303d7705fa";

/// Rewards coordinator events used by the tests.
pub const REWARDS_COORDINATOR_ABI: &str = r#"[
    {"type":"event","name":"RewardsClaimed","anonymous":false,"inputs":[
        {"name":"root","type":"bytes32","indexed":false},
        {"name":"earner","type":"address","indexed":true},
        {"name":"claimer","type":"address","indexed":true},
        {"name":"recipient","type":"address","indexed":true},
        {"name":"token","type":"address","indexed":false},
        {"name":"claimedAmount","type":"uint256","indexed":false}
    ]},
    {"type":"function","name":"setClaimerFor","stateMutability":"nonpayable",
     "inputs":[{"name":"claimer","type":"address"}],"outputs":[]}
]"#;

/// AVS directory events used by the tests.
pub const AVS_DIRECTORY_ABI: &str = r#"[
    {"type":"event","name":"OperatorAVSRegistrationStatusUpdated","anonymous":false,"inputs":[
        {"name":"operator","type":"address","indexed":true},
        {"name":"avs","type":"address","indexed":true},
        {"name":"status","type":"uint8","indexed":false}
    ]}
]"#;

/// Creates an in-memory SQLite Store.
///
/// # Panics
/// Panics if the in-memory database cannot be created (should never happen).
pub fn test_store() -> Arc<Store> {
    Arc::new(Store::new(":memory:").expect("in-memory store should always open"))
}

/// Mainnet addresses, reconciliation effectively disabled.
pub fn test_config() -> Config {
    let mut config = Config::for_chain(Chain::Mainnet);
    config.restaked_strategies_interval = 1_000_000_007;
    config.restaked_strategies_workers = 2;
    config
}

pub fn tx_hash(n: u64) -> String {
    format!("0x{n:064x}")
}

pub fn block_hash(n: u64) -> String {
    format!("0x{:064x}", 0xb10c_0000_0000u64 + n)
}

pub fn address_topic(address: &str) -> String {
    format!("0x{:0>64}", address.trim_start_matches("0x"))
}

pub fn u256_word(value: U256) -> String {
    hex::encode(value.to_be_bytes::<32>())
}

pub fn event_topic(signature: &str) -> String {
    format!("{:#x}", keccak256(signature.as_bytes()))
}

pub fn sample_block(number: u64, transactions: Vec<EthereumTransaction>) -> EthereumBlock {
    EthereumBlock {
        number,
        hash: block_hash(number),
        parent_hash: block_hash(number.saturating_sub(1)),
        timestamp: 1_726_000_000 + number * 12,
        transactions,
    }
}

pub fn sample_tx(hash: &str, to: Option<&str>, block_number: u64, transaction_index: u64) -> EthereumTransaction {
    EthereumTransaction {
        hash: hash.to_string(),
        from: SENDER.to_string(),
        to: to.map(str::to_string),
        input: "0x".to_string(),
        block_number,
        transaction_index,
    }
}

pub fn sample_receipt(tx: &EthereumTransaction, logs: Vec<EthereumLog>) -> EthereumReceipt {
    EthereumReceipt {
        transaction_hash: tx.hash.clone(),
        transaction_index: tx.transaction_index,
        block_number: tx.block_number,
        from: tx.from.clone(),
        to: tx.to.clone(),
        contract_address: None,
        logs,
        contract_bytecode: None,
    }
}

pub fn sample_log(
    tx: &EthereumTransaction,
    address: &str,
    topics: Vec<String>,
    data: String,
    log_index: u64,
) -> EthereumLog {
    EthereumLog {
        address: address.to_string(),
        topics,
        data,
        block_number: tx.block_number,
        transaction_hash: tx.hash.clone(),
        transaction_index: tx.transaction_index,
        log_index,
    }
}

/// `RewardsClaimed` without a recipient topic, as emitted at log 270.
pub fn rewards_claimed_log(tx: &EthereumTransaction, coordinator: &str, log_index: u64) -> EthereumLog {
    let amount = U256::from_str_radix(CLAIMED_AMOUNT, 10).expect("valid amount");
    let data = format!(
        "0x{}{}{}",
        CLAIM_ROOT.trim_start_matches("0x"),
        address_topic(TOKEN).trim_start_matches("0x"),
        u256_word(amount)
    );
    sample_log(
        tx,
        coordinator,
        vec![
            event_topic("RewardsClaimed(bytes32,address,address,address,address,uint256)"),
            address_topic(EARNER),
            address_topic(EARNER),
        ],
        data,
        log_index,
    )
}

pub fn registration_log(
    tx: &EthereumTransaction,
    avs_directory: &str,
    operator: &str,
    avs: &str,
    status: u8,
    log_index: u64,
) -> EthereumLog {
    sample_log(
        tx,
        avs_directory,
        vec![
            event_topic("OperatorAVSRegistrationStatusUpdated(address,address,uint8)"),
            address_topic(operator),
            address_topic(avs),
        ],
        format!("0x{}", u256_word(U256::from(status))),
        log_index,
    )
}

/// `Deposit(staker, token, strategy, shares)` on the strategy manager.
pub fn deposit_log(
    tx: &EthereumTransaction,
    strategy_manager: &str,
    staker: &str,
    shares: u64,
    log_index: u64,
) -> EthereumLog {
    let data = format!(
        "0x{}{}{}{}",
        address_topic(staker).trim_start_matches("0x"),
        address_topic(TOKEN).trim_start_matches("0x"),
        address_topic(STRATEGY).trim_start_matches("0x"),
        u256_word(U256::from(shares))
    );
    sample_log(
        tx,
        strategy_manager,
        vec![event_topic("Deposit(address,address,address,uint256)")],
        data,
        log_index,
    )
}

/// In-memory chain. Receipt batches are answered in reverse order so callers
/// must correlate by transaction hash.
#[derive(Default)]
pub struct MockChainGateway {
    blocks: Mutex<HashMap<u64, EthereumBlock>>,
    receipts: Mutex<HashMap<String, EthereumReceipt>>,
    storage: Mutex<HashMap<String, String>>,
    code: Mutex<HashMap<String, String>>,
    latest: AtomicUsize,
    pub block_fetches: AtomicUsize,
    pub storage_reads: AtomicUsize,
    pub code_reads: AtomicUsize,
}

impl MockChainGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&self, block: EthereumBlock, receipts: Vec<EthereumReceipt>) {
        let mut stored = self.receipts.lock().expect("receipts lock");
        for receipt in receipts {
            stored.insert(receipt.transaction_hash.clone(), receipt);
        }
        self.latest
            .fetch_max(block.number as usize, Ordering::SeqCst);
        self.blocks.lock().expect("blocks lock").insert(block.number, block);
    }

    pub fn set_storage(&self, address: &str, value: &str) {
        self.storage
            .lock()
            .expect("storage lock")
            .insert(address.to_lowercase(), value.to_string());
    }

    pub fn set_code(&self, address: &str, code: &str) {
        self.code
            .lock()
            .expect("code lock")
            .insert(address.to_lowercase(), code.to_string());
    }
}

#[async_trait]
impl ChainGateway for MockChainGateway {
    async fn get_block_by_number(&self, block_number: u64) -> Result<EthereumBlock> {
        self.block_fetches.fetch_add(1, Ordering::SeqCst);
        self.blocks
            .lock()
            .expect("blocks lock")
            .get(&block_number)
            .cloned()
            .ok_or_else(|| eyre!("block {block_number} not found"))
    }

    async fn get_transaction_receipt(&self, hash: &str) -> Result<EthereumReceipt> {
        self.receipts
            .lock()
            .expect("receipts lock")
            .get(hash)
            .cloned()
            .ok_or_else(|| eyre!("receipt {hash} not found"))
    }

    async fn get_transaction_receipts(&self, hashes: &[String]) -> Result<Vec<EthereumReceipt>> {
        let receipts = self.receipts.lock().expect("receipts lock");
        hashes
            .iter()
            .rev()
            .map(|hash| {
                receipts
                    .get(hash)
                    .cloned()
                    .ok_or_else(|| eyre!("receipt {hash} not found"))
            })
            .collect()
    }

    async fn get_storage_at(&self, address: &str, _slot: &str, _block: Option<u64>) -> Result<String> {
        self.storage_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .storage
            .lock()
            .expect("storage lock")
            .get(&address.to_lowercase())
            .cloned()
            .unwrap_or_else(|| format!("0x{}", "0".repeat(64))))
    }

    async fn get_code(&self, address: &str) -> Result<String> {
        self.code_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .code
            .lock()
            .expect("code lock")
            .get(&address.to_lowercase())
            .cloned()
            .unwrap_or_else(|| "0x".to_string()))
    }

    async fn get_latest_block_number(&self) -> Result<u64> {
        Ok(self.latest.load(Ordering::SeqCst) as u64)
    }

    async fn call(&self, to: &str, _data: &str, _block_number: u64) -> Result<String> {
        Err(eyre!("eth_call to {to} is not supported by the mock chain"))
    }
}

/// Explorer stand-in; unknown addresses are "not verified".
#[derive(Default)]
pub struct MockAbiSource {
    abis: Mutex<HashMap<String, String>>,
    pub lookups: AtomicUsize,
}

impl MockAbiSource {
    pub fn with_abis(abis: &[(&str, &str)]) -> Self {
        let source = Self::default();
        for (address, abi) in abis {
            source.set_abi(address, abi);
        }
        source
    }

    pub fn set_abi(&self, address: &str, abi: &str) {
        self.abis
            .lock()
            .expect("abis lock")
            .insert(address.to_lowercase(), abi.to_string());
    }
}

#[async_trait]
impl AbiSource for MockAbiSource {
    async fn contract_abi(&self, address: &str) -> Result<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.abis
            .lock()
            .expect("abis lock")
            .get(&address.to_lowercase())
            .cloned()
            .ok_or_else(|| AbiSourceError::NotVerified(address.to_string()).into())
    }
}

/// AVS reads keyed by (avs, operator). Tracks how many calls overlap.
#[derive(Default)]
pub struct MockContractCaller {
    strategies: Mutex<HashMap<(String, String), Vec<String>>>,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub fail: AtomicBool,
}

impl MockContractCaller {
    pub fn set_strategies(&self, avs: &str, operator: &str, strategies: &[&str]) {
        self.strategies.lock().expect("strategies lock").insert(
            (avs.to_lowercase(), operator.to_lowercase()),
            strategies.iter().map(|s| s.to_string()).collect(),
        );
    }
}

#[async_trait]
impl ContractCaller for MockContractCaller {
    async fn get_operator_restaked_strategies(
        &self,
        avs: &str,
        operator: &str,
        _block_number: u64,
    ) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(eyre!("execution reverted"));
        }
        Ok(self
            .strategies
            .lock()
            .expect("strategies lock")
            .get(&(avs.to_lowercase(), operator.to_lowercase()))
            .cloned()
            .unwrap_or_default())
    }
}

/// Everything a pipeline test needs to poke at.
pub struct Harness {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub chain: Arc<MockChainGateway>,
    pub abis: Arc<MockAbiSource>,
    pub caller: Arc<MockContractCaller>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let abis = MockAbiSource::with_abis(&[
            (config.contracts.rewards_coordinator.as_str(), REWARDS_COORDINATOR_ABI),
            (config.contracts.avs_directory.as_str(), AVS_DIRECTORY_ABI),
        ]);
        Self {
            config: Arc::new(config),
            store: test_store(),
            chain: Arc::new(MockChainGateway::new()),
            abis: Arc::new(abis),
            caller: Arc::new(MockContractCaller::default()),
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline_with(self.abis.clone(), self.caller.clone())
    }

    /// Pipeline over this harness's chain and store with other ABI and
    /// contract call sources.
    pub fn pipeline_with(&self, abis: Arc<dyn AbiSource>, caller: Arc<dyn ContractCaller>) -> Pipeline {
        Pipeline::build(self.config.clone(), self.store.clone(), self.chain.clone(), abis, caller)
            .expect("pipeline should build")
    }

    /// Adds block `number` with one rewards claim against the coordinator.
    pub fn add_claim_block(&self, number: u64) -> EthereumTransaction {
        let coordinator = self.config.contracts.rewards_coordinator.clone();
        let tx = sample_tx(&tx_hash(number), Some(&coordinator), number, 0);
        let receipt = sample_receipt(&tx, vec![rewards_claimed_log(&tx, &coordinator, 270)]);
        self.chain.add_block(sample_block(number, vec![tx.clone()]), vec![receipt]);
        tx
    }
}
