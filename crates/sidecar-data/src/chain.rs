//! Chain Gateway contract and the chain data types it returns.
//!
//! The core only depends on [`ChainGateway`]; [`crate::rpc::RpcClient`] is
//! the alloy provider implementation and tests provide in-memory ones.
//! Hashes, addresses and byte strings are carried as `0x` hex text, which is
//! how the store and the decoder consume them.

use async_trait::async_trait;
use eyre::{Context, Result};
use sha2::{Digest, Sha256};

/// Storage slot holding the implementation address of an EIP-1967 proxy.
pub const EIP1967_IMPLEMENTATION_SLOT: &str =
    "0x360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc";

/// The zero address as lowercase hex.
pub const NULL_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Hashes deployed bytecode: SHA-256 over the raw bytes, lowercase hex.
///
/// # Errors
/// Returns error if `bytecode` is not valid hex.
pub fn hash_bytecode(bytecode: &str) -> Result<String> {
    let raw = alloy::hex::decode(bytecode.trim_start_matches("0x"))
        .wrap_err("bytecode is not valid hex")?;
    Ok(alloy::hex::encode(Sha256::digest(raw)))
}

/// A block with its full transaction list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EthereumBlock {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
    pub transactions: Vec<EthereumTransaction>,
}

/// Transaction object embedded in a block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EthereumTransaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub input: String,
    pub block_number: u64,
    pub transaction_index: u64,
}

/// A transaction receipt.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EthereumReceipt {
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub block_number: u64,
    pub from: String,
    pub to: Option<String>,
    pub contract_address: Option<String>,
    pub logs: Vec<EthereumLog>,
    /// Bytecode of `contract_address`, attached by the fetcher.
    pub contract_bytecode: Option<String>,
}

impl EthereumReceipt {
    /// The address the transaction acted on: its recipient, or the contract
    /// it created.
    pub fn target_address(&self) -> Option<&str> {
        self.to
            .as_deref()
            .filter(|to| !to.is_empty())
            .or_else(|| self.contract_address.as_deref().filter(|c| !c.is_empty()))
    }

    /// The created contract address, if this is a contract-creation receipt.
    pub fn created_contract(&self) -> Option<&str> {
        match self.to.as_deref() {
            Some(to) if !to.is_empty() => None,
            _ => self.contract_address.as_deref().filter(|c| !c.is_empty()),
        }
    }
}

/// Event log inside a receipt.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EthereumLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: u64,
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub log_index: u64,
}

/// Everything the core needs from an Ethereum node.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Fetches a block with full transaction objects.
    async fn get_block_by_number(&self, block_number: u64) -> Result<EthereumBlock>;

    async fn get_transaction_receipt(&self, hash: &str) -> Result<EthereumReceipt>;

    /// Fetches receipts for `hashes` in batched round trips. The order of
    /// the result is not guaranteed to match `hashes`; correlate by
    /// `transaction_hash`.
    ///
    /// # Errors
    /// Returns error if any receipt is missing or the node rejects a batch.
    async fn get_transaction_receipts(&self, hashes: &[String]) -> Result<Vec<EthereumReceipt>>;

    /// Reads a storage slot at `block`, or at `latest` when `None`.
    async fn get_storage_at(&self, address: &str, slot: &str, block: Option<u64>) -> Result<String>;

    /// Reads the deployed bytecode at `latest`.
    async fn get_code(&self, address: &str) -> Result<String>;

    async fn get_latest_block_number(&self) -> Result<u64>;

    /// `eth_call` against `to` at a historical block.
    async fn call(&self, to: &str, data: &str, block_number: u64) -> Result<String>;
}
