//! Row types persisted by the indexer.
//!
//! Addresses and hashes are stored as lowercase `0x`-prefixed hex text.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An indexed block header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block height.
    pub number: u64,
    /// Block hash (hex text).
    pub hash: String,
    /// Parent block hash (hex text).
    pub parent_hash: String,
    /// Timestamp in unix seconds.
    pub block_time: u64,
}

/// A transaction that touched at least one configured protocol address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Block the transaction was included in.
    pub block_number: u64,
    /// Transaction hash (hex text).
    pub transaction_hash: String,
    /// Position within the block.
    pub transaction_index: u64,
    /// Sender address.
    pub from_address: String,
    /// Recipient address (None for contract creation).
    pub to_address: Option<String>,
    /// Address of the contract created by this transaction, if any.
    pub contract_address: Option<String>,
    /// SHA-256 of the created contract's bytecode, if any.
    pub bytecode_hash: Option<String>,
}

/// One decoded event argument.
///
/// `value` is `Null` when the argument could not be recovered from the log
/// (for example an indexed argument without a matching topic).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogArgument {
    /// Parameter name from the ABI.
    pub name: String,
    /// Solidity type string (e.g. `address`, `uint256`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Decoded value.
    pub value: Value,
    /// Whether the parameter was emitted as a topic.
    pub indexed: bool,
}

/// A decoded event log belonging to an interesting transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionLog {
    /// Block number.
    pub block_number: u64,
    /// Hash of the emitting transaction.
    pub transaction_hash: String,
    /// Index of the emitting transaction within the block.
    pub transaction_index: u64,
    /// Index of the log within the block.
    pub log_index: u64,
    /// Emitting contract address.
    pub address: String,
    /// Event name, or the raw topic0 hash when no ABI matched.
    pub event_name: String,
    /// Arguments in ABI declaration order.
    pub arguments: Vec<LogArgument>,
    /// Unindexed fields keyed by parameter name.
    pub output_data: Map<String, Value>,
}

impl TransactionLog {
    /// Returns the value of the argument at `index`, treating a missing
    /// argument the same as a `null` one.
    pub fn argument_value(&self, index: usize) -> &Value {
        self.arguments
            .get(index)
            .map(|arg| &arg.value)
            .unwrap_or(&Value::Null)
    }

    /// Returns the argument at `index` as a lowercase string, or `None` when
    /// it is null or not a string.
    pub fn argument_str(&self, index: usize) -> Option<String> {
        self.argument_value(index)
            .as_str()
            .map(|value| value.to_lowercase())
    }
}

/// A contract seen on chain, with whatever ABI facts have been discovered.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    /// Lowercased contract address.
    pub contract_address: String,
    /// JSON ABI, empty when unknown.
    pub contract_abi: String,
    /// Whether the ABI came from a verified source.
    pub verified: bool,
    /// SHA-256 of the deployed bytecode.
    pub bytecode_hash: String,
    /// Verified contract sharing this contract's bytecode, empty if none.
    pub matching_contract_address: String,
    /// An ABI lookup has already been attempted.
    pub checked_for_abi: bool,
    /// The EIP-1967 slot has already been inspected.
    pub checked_for_proxy: bool,
}

/// "At `block_number`, `contract_address` delegates to `proxy_contract_address`."
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyContract {
    /// Height at which the delegation was observed.
    pub block_number: u64,
    /// The proxy.
    pub contract_address: String,
    /// The implementation the proxy points at.
    pub proxy_contract_address: String,
}

/// Point-in-time view of a contract, its current implementation, and the
/// lookalikes of both.
///
/// Empty strings mean "not present".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractsTree {
    pub base_address: String,
    pub base_abi: String,
    pub base_proxy_address: String,
    pub base_proxy_abi: String,
    pub base_proxy_like_address: String,
    pub base_proxy_like_abi: String,
    pub base_like_address: String,
    pub base_like_abi: String,
}

impl ContractsTree {
    /// Merges every known ABI into a single JSON array.
    ///
    /// Entries are emitted implementation-first (proxy lookalike, proxy,
    /// base, base lookalike) so that when two ABIs declare the same event
    /// the implementation's definition is found first. Returns an empty
    /// string when no ABI is known.
    pub fn combine_abis(&self) -> String {
        let parts: Vec<&str> = [
            &self.base_proxy_like_abi,
            &self.base_proxy_abi,
            &self.base_abi,
            &self.base_like_abi,
        ]
        .into_iter()
        .map(|abi| strip_array_brackets(abi))
        .filter(|abi| !abi.is_empty())
        .collect();

        if parts.is_empty() {
            return String::new();
        }
        format!("[{}]", parts.join(","))
    }
}

fn strip_array_brackets(abi: &str) -> &str {
    let trimmed = abi.trim();
    let trimmed = trimmed.strip_prefix('[').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix(']').unwrap_or(trimmed);
    trimmed.trim()
}

/// Deterministic digest of all state committed for a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRoot {
    pub eth_block_number: u64,
    pub eth_block_hash: String,
    pub state_root: String,
}

/// An operator currently registered to an AVS.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActiveAvsOperator {
    pub avs: String,
    pub operator: String,
}

/// A strategy an operator has restaked into an AVS, as of a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorRestakedStrategy {
    pub block_number: u64,
    /// RFC 3339 block timestamp.
    pub block_time: String,
    pub avs_directory_address: String,
    pub operator: String,
    pub avs: String,
    pub strategy: String,
}
