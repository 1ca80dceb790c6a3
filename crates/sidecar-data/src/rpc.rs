//! Alloy provider integration for Ethereum nodes.
//!
//! Implements [`ChainGateway`] over an HTTP alloy provider and maps alloy's
//! RPC types into the chain data types in [`crate::chain`]. Transport
//! failures are retried on the [`Backoff::rpc`] schedule; error responses
//! returned by the node are final.

use alloy::consensus::Transaction as _;
use alloy::hex;
use alloy::network::{Ethereum, TransactionResponse};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::eth::{BlockId, BlockNumberOrTag};
use alloy::rpc::types::{Block, Log, TransactionReceipt};
use alloy::transports::TransportError;
use async_trait::async_trait;
use eyre::{eyre, Context, Result};
use serde_json::json;
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use crate::chain::{ChainGateway, EthereumBlock, EthereumLog, EthereumReceipt, EthereumTransaction};
use crate::retry::{retry, Backoff, Sleeper, TokioSleeper};

/// Default number of receipt requests per JSON-RPC batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

type ProviderType = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider<Ethereum>,
>;

/// Ethereum node client backed by an alloy HTTP provider.
pub struct RpcClient {
    provider: Arc<ProviderType>,
    url: String,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
    batch_size: usize,
}

impl RpcClient {
    /// Creates a client for `url` with the default retry schedule. No
    /// request is made.
    ///
    /// # Errors
    /// Returns error if `url` is not a valid URL.
    pub fn new(url: &str) -> Result<Self> {
        let provider = ProviderBuilder::new().on_http(url.parse().wrap_err("invalid RPC URL format")?);
        Ok(Self {
            provider: Arc::new(provider),
            url: url.to_string(),
            backoff: Backoff::rpc(),
            sleeper: Arc::new(TokioSleeper),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    /// Creates a client and checks connectivity with `eth_blockNumber`.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the node cannot be reached.
    #[tracing::instrument(skip_all, fields(rpc_url = %url))]
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Self::new(url)?;
        let block_number = client
            .get_latest_block_number()
            .await
            .wrap_err("failed to test RPC connectivity with eth_blockNumber")?;
        tracing::info!(rpc_url = %url, latest_block = block_number, "RPC connection successful");
        Ok(client)
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Runs `op` on the RPC schedule, retrying everything except error
    /// responses from the node.
    async fn with_retry<T, F, Fut>(&self, method: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry(&self.backoff, self.sleeper.as_ref(), op, is_node_error)
            .await
            .wrap_err_with(|| format!("{method} failed"))
    }

    async fn receipts_once(&self, chunk: &[B256]) -> Result<Vec<Option<TransactionReceipt>>> {
        let mut batch = alloy::rpc::client::BatchRequest::new(self.provider.client());
        let mut waiters = Vec::with_capacity(chunk.len());
        for hash in chunk {
            waiters.push(
                batch.add_call::<_, Option<TransactionReceipt>>("eth_getTransactionReceipt", &(*hash,))?,
            );
        }
        batch.send().await?;

        let mut receipts = Vec::with_capacity(waiters.len());
        for waiter in waiters {
            receipts.push(waiter.await?);
        }
        Ok(receipts)
    }
}

fn is_node_error(err: &eyre::Report) -> bool {
    err.downcast_ref::<TransportError>()
        .is_some_and(|err| err.as_error_resp().is_some())
}

fn parse_address(address: &str) -> Result<Address> {
    address
        .parse()
        .wrap_err_with(|| format!("invalid address {address}"))
}

fn parse_hash(hash: &str) -> Result<B256> {
    hash.parse().wrap_err_with(|| format!("invalid hash {hash}"))
}

fn block_from_rpc(block: &Block) -> Result<EthereumBlock> {
    let number = block.header.number;
    let transactions = block
        .transactions
        .as_transactions()
        .ok_or_else(|| eyre!("block {number} was returned without transaction bodies"))?;

    Ok(EthereumBlock {
        number,
        hash: format!("{:#x}", block.header.hash),
        parent_hash: format!("{:#x}", block.header.parent_hash),
        timestamp: block.header.timestamp,
        transactions: transactions
            .iter()
            .map(|tx| EthereumTransaction {
                hash: format!("{:#x}", tx.tx_hash()),
                from: format!("{:#x}", tx.from()),
                to: tx.to().map(|to| format!("{to:#x}")),
                input: hex::encode_prefixed(tx.input()),
                block_number: tx.block_number().unwrap_or(number),
                transaction_index: tx.transaction_index().unwrap_or_default(),
            })
            .collect(),
    })
}

fn log_from_rpc(log: &Log) -> EthereumLog {
    EthereumLog {
        address: format!("{:#x}", log.address()),
        topics: log.topics().iter().map(|topic| format!("{topic:#x}")).collect(),
        data: hex::encode_prefixed(&log.data().data),
        block_number: log.block_number.unwrap_or_default(),
        transaction_hash: log
            .transaction_hash
            .map(|hash| format!("{hash:#x}"))
            .unwrap_or_default(),
        transaction_index: log.transaction_index.unwrap_or_default(),
        log_index: log.log_index.unwrap_or_default(),
    }
}

fn receipt_from_rpc(receipt: &TransactionReceipt) -> EthereumReceipt {
    EthereumReceipt {
        transaction_hash: format!("{:#x}", receipt.transaction_hash),
        transaction_index: receipt.transaction_index.unwrap_or_default(),
        block_number: receipt.block_number.unwrap_or_default(),
        from: format!("{:#x}", receipt.from),
        to: receipt.to.map(|to| format!("{to:#x}")),
        contract_address: receipt.contract_address.map(|address| format!("{address:#x}")),
        logs: receipt.inner.logs().iter().map(log_from_rpc).collect(),
        contract_bytecode: None,
    }
}

#[async_trait]
impl ChainGateway for RpcClient {
    #[tracing::instrument(skip(self))]
    async fn get_block_by_number(&self, block_number: u64) -> Result<EthereumBlock> {
        let block = self
            .with_retry("eth_getBlockByNumber", || async move {
                self.provider
                    .get_block(BlockId::Number(BlockNumberOrTag::Number(block_number)))
                    .full()
                    .await
                    .map_err(eyre::Report::new)
            })
            .await?
            .ok_or_else(|| eyre!("block {block_number} not found"))?;
        block_from_rpc(&block)
    }

    async fn get_transaction_receipt(&self, hash: &str) -> Result<EthereumReceipt> {
        let tx_hash = parse_hash(hash)?;
        let receipt = self
            .with_retry("eth_getTransactionReceipt", || async move {
                self.provider
                    .get_transaction_receipt(tx_hash)
                    .await
                    .map_err(eyre::Report::new)
            })
            .await?
            .ok_or_else(|| eyre!("receipt not found for transaction {hash}"))?;
        Ok(receipt_from_rpc(&receipt))
    }

    #[tracing::instrument(skip_all, fields(transactions = hashes.len()))]
    async fn get_transaction_receipts(&self, hashes: &[String]) -> Result<Vec<EthereumReceipt>> {
        let hashes = hashes
            .iter()
            .map(|hash| parse_hash(hash))
            .collect::<Result<Vec<_>>>()?;

        let mut receipts = Vec::with_capacity(hashes.len());
        for chunk in hashes.chunks(self.batch_size) {
            let batch = self
                .with_retry("eth_getTransactionReceipt batch", || self.receipts_once(chunk))
                .await?;
            for (hash, receipt) in chunk.iter().zip(batch) {
                let receipt = receipt.ok_or_else(|| eyre!("receipt not found for transaction {hash:#x}"))?;
                receipts.push(receipt_from_rpc(&receipt));
            }
            tracing::debug!(chunk = chunk.len(), "received receipt batch");
        }
        Ok(receipts)
    }

    async fn get_storage_at(&self, address: &str, slot: &str, block: Option<u64>) -> Result<String> {
        let address = parse_address(address)?;
        let slot = U256::from_be_bytes(parse_hash(slot)?.0);
        let block_id = block.map_or(BlockId::latest(), BlockId::number);
        let value = self
            .with_retry("eth_getStorageAt", || async move {
                self.provider
                    .get_storage_at(address, slot)
                    .block_id(block_id)
                    .await
                    .map_err(eyre::Report::new)
            })
            .await?;
        Ok(format!("{:#x}", B256::from(value)))
    }

    async fn get_code(&self, address: &str) -> Result<String> {
        let address = parse_address(address)?;
        let code = self
            .with_retry("eth_getCode", || async move {
                self.provider
                    .get_code_at(address)
                    .await
                    .map_err(eyre::Report::new)
            })
            .await?;
        Ok(hex::encode_prefixed(code))
    }

    async fn get_latest_block_number(&self) -> Result<u64> {
        self.with_retry("eth_blockNumber", || async move {
            self.provider.get_block_number().await.map_err(eyre::Report::new)
        })
        .await
    }

    async fn call(&self, to: &str, data: &str, block_number: u64) -> Result<String> {
        let params = json!([{ "to": to, "data": data }, BlockNumberOrTag::Number(block_number)]);
        let output = self
            .with_retry("eth_call", || {
                let params = params.clone();
                async move {
                    self.provider
                        .raw_request::<_, Bytes>(Cow::Borrowed("eth_call"), params)
                        .await
                        .map_err(eyre::Report::new)
                }
            })
            .await?;
        Ok(hex::encode_prefixed(output))
    }
}
