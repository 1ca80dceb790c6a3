//! Block indexing.
//!
//! Persists the block row, picks out the transactions that touch a
//! configured protocol address, decodes their logs and records contracts
//! they create or upgrade. Everything about a block is decoded before any
//! transaction or log row is written.

use alloy::json_abi::JsonAbi;
use eyre::{Context, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use sidecar_data::chain::{hash_bytecode, EthereumLog, EthereumReceipt, EthereumTransaction};
use sidecar_data::config::Config;
use sidecar_data::store::Store;
use sidecar_data::types::{Block, Transaction, TransactionLog};

use crate::contracts::{ContractResolver, UPGRADED_EVENT};
use crate::decoder::{decode_log, decode_transaction_input, parse_abi, DecodedLog, UNKNOWN_METHOD};
use crate::fetcher::{FetchedBlock, Fetcher};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexErrorKind {
    ReceiptNotFound,
    FailedToParseTransaction,
    FailedToCombineAbis,
    FailedToFindContract,
    FailedToParseAbi,
    FailedToDecodeLog,
    FailedToIndexBlock,
}

/// A failure tied to a specific block, transaction or log.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}{}", location(.block_number, .transaction_hash, .log_index))]
pub struct IndexError {
    pub kind: IndexErrorKind,
    pub message: String,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<u64>,
    pub metadata: BTreeMap<String, String>,
}

impl IndexError {
    pub fn new(kind: IndexErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            block_number: None,
            transaction_hash: None,
            log_index: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_block_number(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }

    pub fn with_transaction_hash(mut self, transaction_hash: &str) -> Self {
        self.transaction_hash = Some(transaction_hash.to_string());
        self
    }

    pub fn with_log_index(mut self, log_index: u64) -> Self {
        self.log_index = Some(log_index);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

fn location(block_number: &Option<u64>, transaction_hash: &Option<String>, log_index: &Option<u64>) -> String {
    let Some(block_number) = block_number else {
        return String::new();
    };
    let mut location = format!(" (block {block_number}");
    if let Some(hash) = transaction_hash {
        location.push_str(&format!(", tx {hash}"));
    }
    if let Some(log_index) = log_index {
        location.push_str(&format!(", log {log_index}"));
    }
    location.push(')');
    location
}

/// An interesting transaction with its decoded input and logs.
#[derive(Clone, Debug)]
pub struct ParsedTransaction {
    pub transaction: EthereumTransaction,
    pub receipt: EthereumReceipt,
    /// Empty when the target has no ABI or the input carries no selector.
    pub method_name: String,
    pub decoded_input: Map<String, Value>,
    /// Decoded logs emitted by configured addresses, in log order.
    pub logs: Vec<DecodedLog>,
}

impl ParsedTransaction {
    /// The decoded logs as rows for `block_number`.
    pub fn transaction_logs(&self, block_number: u64) -> Vec<TransactionLog> {
        self.logs
            .iter()
            .map(|log| TransactionLog {
                block_number,
                transaction_hash: self.transaction.hash.to_lowercase(),
                transaction_index: self.transaction.transaction_index,
                log_index: log.log_index,
                address: log.address.clone(),
                event_name: log.event_name.clone(),
                arguments: log.arguments.clone(),
                output_data: log.output_data.clone(),
            })
            .collect()
    }

    pub fn upgraded_logs(&self) -> Vec<&DecodedLog> {
        find_contract_upgraded_logs(&self.logs)
    }
}

/// Result of fetching a block and recording its header.
#[derive(Clone, Debug)]
pub struct IndexedBlock {
    pub fetched: FetchedBlock,
    pub block: Block,
    /// The block row was already present and was left untouched.
    pub already_indexed: bool,
}

pub fn find_contract_upgraded_logs(logs: &[DecodedLog]) -> Vec<&DecodedLog> {
    logs.iter().filter(|log| log.event_name == UPGRADED_EVENT).collect()
}

pub struct Indexer {
    store: Arc<Store>,
    fetcher: Fetcher,
    resolver: Arc<ContractResolver>,
    config: Arc<Config>,
}

impl Indexer {
    pub fn new(store: Arc<Store>, fetcher: Fetcher, resolver: Arc<ContractResolver>, config: Arc<Config>) -> Self {
        Self {
            store,
            fetcher,
            resolver,
            config,
        }
    }

    pub fn resolver(&self) -> &ContractResolver {
        &self.resolver
    }

    /// Fetches `block_number` and records its header.
    ///
    /// An existing block is reported as already indexed unless `reindex`
    /// is set, in which case it is purged (with its transactions and logs)
    /// and recorded afresh.
    ///
    /// # Errors
    /// Returns error if fetching or storing the block fails.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_and_index_block(&self, block_number: u64, reindex: bool) -> Result<IndexedBlock> {
        let fetched = self.fetcher.fetch_block(block_number).await?;

        if let Some(existing) = self.store.get_block_by_number(block_number)? {
            if !reindex {
                tracing::debug!(block_number, "block already indexed");
                return Ok(IndexedBlock {
                    fetched,
                    block: existing,
                    already_indexed: true,
                });
            }
            self.store.delete_block(block_number)?;
            tracing::info!(block_number, "purged block for reindex");
        }

        let block = Block {
            number: fetched.block.number,
            hash: fetched.block.hash.to_lowercase(),
            parent_hash: fetched.block.parent_hash.to_lowercase(),
            block_time: fetched.block.timestamp,
        };
        self.store.insert_block(&block).map_err(|err| {
            err.wrap_err(
                IndexError::new(IndexErrorKind::FailedToIndexBlock, "failed to insert block")
                    .with_block_number(block_number),
            )
        })?;

        Ok(IndexedBlock {
            fetched,
            block,
            already_indexed: false,
        })
    }

    pub fn is_interesting_address(&self, address: &str) -> bool {
        self.config.is_interesting_address(address)
    }

    /// Whether the transaction targets, or created, a configured address.
    pub fn is_interesting_transaction(&self, tx: &EthereumTransaction, receipt: &EthereumReceipt) -> bool {
        let targets = tx
            .to
            .as_deref()
            .is_some_and(|to| !to.is_empty() && self.is_interesting_address(to));
        let created = receipt
            .contract_address
            .as_deref()
            .is_some_and(|address| !address.is_empty() && self.is_interesting_address(address));
        targets || created
    }

    fn has_interesting_log(&self, receipt: &EthereumReceipt) -> bool {
        receipt
            .logs
            .iter()
            .any(|log| self.is_interesting_address(&log.address))
    }

    /// Transactions that are interesting themselves or carry a log from a
    /// configured address. Transactions without a receipt are skipped.
    pub fn filter_interesting_transactions<'a>(&self, fetched: &'a FetchedBlock) -> Vec<&'a EthereumTransaction> {
        fetched
            .block
            .transactions
            .iter()
            .filter(|tx| match fetched.receipt(&tx.hash) {
                Some(receipt) => self.has_interesting_log(receipt) || self.is_interesting_transaction(tx, receipt),
                None => {
                    tracing::error!(transaction_hash = %tx.hash, "receipt not found for transaction");
                    false
                }
            })
            .collect()
    }

    /// Decodes every transaction of the block that is interesting or emits
    /// an interesting log.
    ///
    /// A transaction whose ABI cannot be resolved or parsed is logged and
    /// skipped.
    ///
    /// # Errors
    /// Returns [`IndexError`] with kind `ReceiptNotFound` if a receipt is
    /// missing.
    pub async fn parse_interesting_transactions_and_logs(
        &self,
        fetched: &FetchedBlock,
    ) -> Result<Vec<ParsedTransaction>, IndexError> {
        let block_number = fetched.block.number;
        let mut parsed = Vec::new();

        for tx in &fetched.block.transactions {
            let receipt = fetched.receipt(&tx.hash).ok_or_else(|| {
                IndexError::new(IndexErrorKind::ReceiptNotFound, "receipt not found for transaction")
                    .with_block_number(block_number)
                    .with_transaction_hash(&tx.hash)
            })?;

            let transaction = match self.parse_transaction_logs(tx, receipt, block_number).await {
                Ok(Some(transaction)) => transaction,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(
                        transaction_hash = %tx.hash,
                        block_number,
                        error = %err,
                        "failed to process transaction logs"
                    );
                    continue;
                }
            };

            if !transaction.logs.is_empty() || self.is_interesting_transaction(tx, receipt) {
                tracing::debug!(
                    transaction_hash = %tx.hash,
                    block_number,
                    log_count = transaction.logs.len(),
                    "parsed transaction"
                );
                parsed.push(transaction);
            }
        }
        Ok(parsed)
    }

    /// Decodes a transaction's input and its logs from configured addresses.
    ///
    /// Returns `None` for transactions with neither recipient nor created
    /// contract.
    ///
    /// # Errors
    /// Returns [`IndexError`] if the target's contract or ABI cannot be
    /// resolved.
    pub async fn parse_transaction_logs(
        &self,
        tx: &EthereumTransaction,
        receipt: &EthereumReceipt,
        block_number: u64,
    ) -> Result<Option<ParsedTransaction>, IndexError> {
        let Some(target) = receipt.target_address().map(str::to_lowercase) else {
            tracing::debug!(transaction_hash = %tx.hash, "transaction has no target address");
            return Ok(None);
        };

        let mut parsed = ParsedTransaction {
            transaction: tx.clone(),
            receipt: receipt.clone(),
            method_name: String::new(),
            decoded_input: Map::new(),
            logs: Vec::new(),
        };

        let mut contract_abi = None;
        if self.is_interesting_address(&target) {
            contract_abi = self
                .resolve_abi(&target, block_number)
                .await
                .map_err(|err| err.with_transaction_hash(&tx.hash))?;

            if let Some(abi) = &contract_abi {
                match decode_transaction_input(abi, &tx.input) {
                    Ok(Some(input)) => {
                        parsed.method_name = input.method_name;
                        parsed.decoded_input = input.arguments;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(transaction_hash = %tx.hash, error = %err, "failed to decode transaction input");
                        parsed.method_name = UNKNOWN_METHOD.to_string();
                    }
                }
            }
        }

        for log in &receipt.logs {
            if !self.is_interesting_address(&log.address) {
                continue;
            }
            match self
                .decode_log_with_abi(contract_abi.as_ref(), &target, log, block_number)
                .await
            {
                Ok(decoded) => parsed.logs.push(decoded),
                Err(err) => {
                    tracing::error!(
                        transaction_hash = %tx.hash,
                        log_index = log.log_index,
                        error = %err,
                        "failed to decode log"
                    );
                }
            }
        }

        Ok(Some(parsed))
    }

    /// Decodes `log`, resolving the emitting contract's ABI when it differs
    /// from the transaction target.
    ///
    /// # Errors
    /// Returns [`IndexError`] with kind `FailedToDecodeLog` for malformed
    /// logs.
    pub async fn decode_log_with_abi(
        &self,
        contract_abi: Option<&JsonAbi>,
        target: &str,
        log: &EthereumLog,
        block_number: u64,
    ) -> Result<DecodedLog, IndexError> {
        let decode = |abi: Option<&JsonAbi>| {
            decode_log(abi, log).map_err(|err| {
                IndexError::new(IndexErrorKind::FailedToDecodeLog, err.to_string())
                    .with_block_number(block_number)
                    .with_transaction_hash(&log.transaction_hash)
                    .with_log_index(log.log_index)
            })
        };

        if log.address.eq_ignore_ascii_case(target) && contract_abi.is_some() {
            return decode(contract_abi);
        }

        let abi = match self.resolve_abi(&log.address, block_number).await {
            Ok(abi) => abi,
            Err(err) => {
                tracing::warn!(address = %log.address, error = %err, "decoding log without ABI");
                None
            }
        };
        decode(abi.as_ref())
    }

    /// Resolves the combined ABI for `address`, creating the contract on
    /// first sight. Returns `None` when no ABI is known.
    async fn resolve_abi(&self, address: &str, block_number: u64) -> Result<Option<JsonAbi>, IndexError> {
        let tree = self
            .resolver
            .find_or_create_contract_with_proxy(address, block_number, None, false)
            .await
            .map_err(|err| {
                IndexError::new(IndexErrorKind::FailedToFindContract, format!("{err:#}"))
                    .with_block_number(block_number)
                    .with_metadata("address", address)
            })?;

        let Some(tree) = tree else {
            return Ok(None);
        };
        let combined = tree.combine_abis();
        if combined.is_empty() {
            return Ok(None);
        }
        parse_abi(&combined).map(Some).map_err(|err| {
            IndexError::new(IndexErrorKind::FailedToParseAbi, err.to_string())
                .with_block_number(block_number)
                .with_metadata("address", address)
        })
    }

    /// Builds transaction rows for the parsed transactions.
    pub fn transaction_rows(&self, block_number: u64, parsed: &[ParsedTransaction]) -> Vec<Transaction> {
        parsed
            .iter()
            .map(|pt| {
                let bytecode_hash = pt.receipt.contract_bytecode.as_deref().and_then(|code| {
                    hash_bytecode(code)
                        .map_err(|err| {
                            tracing::warn!(transaction_hash = %pt.transaction.hash, error = %err, "unhashable bytecode");
                        })
                        .ok()
                });
                Transaction {
                    block_number,
                    transaction_hash: pt.transaction.hash.to_lowercase(),
                    transaction_index: pt.transaction.transaction_index,
                    from_address: pt.transaction.from.to_lowercase(),
                    to_address: pt.transaction.to.as_deref().map(str::to_lowercase),
                    contract_address: pt.receipt.created_contract().map(str::to_lowercase),
                    bytecode_hash,
                }
            })
            .collect()
    }

    /// Writes the transactions and logs of `parsed`.
    ///
    /// A fresh block is written in one batch; a reindexed one row by row
    /// with duplicates ignored.
    ///
    /// # Errors
    /// Returns error if a write fails.
    pub fn index_transactions_and_logs(
        &self,
        block: &Block,
        parsed: &[ParsedTransaction],
        reindex: bool,
    ) -> Result<(usize, usize)> {
        let transactions = self.transaction_rows(block.number, parsed);
        let inserted_transactions = if reindex {
            let mut inserted = 0;
            for transaction in &transactions {
                if self.store.insert_transaction(transaction)? {
                    inserted += 1;
                }
            }
            inserted
        } else {
            self.store
                .insert_transactions(&transactions)
                .wrap_err_with(|| format!("failed to insert transactions for block {}", block.number))?
        };

        let logs: Vec<TransactionLog> = parsed
            .iter()
            .flat_map(|pt| pt.transaction_logs(block.number))
            .collect();
        let inserted_logs = self
            .store
            .insert_transaction_logs(&logs)
            .wrap_err_with(|| format!("failed to insert logs for block {}", block.number))?;

        tracing::debug!(
            block_number = block.number,
            transactions = inserted_transactions,
            logs = inserted_logs,
            "indexed transactions and logs"
        );
        Ok((inserted_transactions, inserted_logs))
    }

    /// Records contracts created by the parsed transactions, using the
    /// proxy slot read during fetching.
    pub async fn index_contracts_for_block(
        &self,
        block: &Block,
        fetched: &FetchedBlock,
        parsed: &[ParsedTransaction],
        reindex: bool,
    ) {
        for pt in parsed {
            let Some(address) = pt.receipt.created_contract().map(str::to_lowercase) else {
                continue;
            };
            let bytecode_hash = pt
                .receipt
                .contract_bytecode
                .as_deref()
                .and_then(|code| hash_bytecode(code).ok())
                .unwrap_or_default();
            let slot_value = fetched.contract_storage.get(&address).map(String::as_str);
            self.handle_contract_creation(&address, &bytecode_hash, slot_value, block.number, reindex)
                .await;
        }
    }

    async fn handle_contract_creation(
        &self,
        address: &str,
        bytecode_hash: &str,
        slot_value: Option<&str>,
        block_number: u64,
        reindex: bool,
    ) {
        if let Err(err) = self.resolver.create_contract(address, bytecode_hash, reindex).await {
            tracing::error!(address, error = %err, "failed to create contract");
            return;
        }
        if let Some(value) = slot_value {
            if let Err(err) = self
                .resolver
                .handle_proxy_contract_creation(address, value, block_number, reindex)
                .await
            {
                tracing::error!(address, error = %err, "failed to record proxy contract");
            }
        }
    }

    /// Appends proxy history for each `Upgraded` log. Failures are logged.
    pub async fn index_contract_upgrades(&self, block_number: u64, logs: &[&DecodedLog]) {
        for log in logs {
            if let Err(err) = self.resolver.handle_contract_upgrade(block_number, log).await {
                tracing::error!(address = %log.address, block_number, error = %err, "failed to index contract upgrade");
            }
        }
    }
}
