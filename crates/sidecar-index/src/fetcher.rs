//! Block fetching.
//!
//! A block arrives with full transactions; receipts follow in batched
//! round trips. Contracts created in the block get their EIP-1967 slot and
//! bytecode read concurrently so the indexer can detect proxies without a
//! second pass.

use dashmap::DashMap;
use eyre::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;

use sidecar_data::chain::{ChainGateway, EthereumBlock, EthereumReceipt, EIP1967_IMPLEMENTATION_SLOT};

/// A block with everything the indexer needs from the chain.
#[derive(Clone, Debug, Default)]
pub struct FetchedBlock {
    pub block: EthereumBlock,
    /// Receipts keyed by lowercase transaction hash.
    pub receipts: HashMap<String, EthereumReceipt>,
    /// EIP-1967 slot value keyed by created contract address.
    pub contract_storage: HashMap<String, String>,
}

impl FetchedBlock {
    pub fn receipt(&self, transaction_hash: &str) -> Option<&EthereumReceipt> {
        self.receipts.get(&transaction_hash.to_lowercase())
    }
}

pub struct Fetcher {
    gateway: Arc<dyn ChainGateway>,
}

impl Fetcher {
    pub fn new(gateway: Arc<dyn ChainGateway>) -> Self {
        Self { gateway }
    }

    /// Fetches block `block_number`, its receipts and the proxy slot and
    /// bytecode of every contract it created.
    ///
    /// # Errors
    /// Returns error if the block or any receipt cannot be fetched. Slot
    /// and bytecode reads are best effort.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_block(&self, block_number: u64) -> Result<FetchedBlock> {
        let block = self
            .gateway
            .get_block_by_number(block_number)
            .await
            .wrap_err_with(|| format!("failed to fetch block {block_number}"))?;

        let hashes: Vec<String> = block.transactions.iter().map(|tx| tx.hash.clone()).collect();
        tracing::debug!(block_number, transactions = hashes.len(), "fetching transaction receipts");

        let receipts = if hashes.is_empty() {
            Vec::new()
        } else {
            self.gateway
                .get_transaction_receipts(&hashes)
                .await
                .wrap_err_with(|| format!("failed to fetch receipts for block {block_number}"))?
        };
        let mut receipts: HashMap<String, EthereumReceipt> = receipts
            .into_iter()
            .map(|receipt| (receipt.transaction_hash.to_lowercase(), receipt))
            .collect();

        let created: Vec<String> = receipts
            .values()
            .filter_map(|receipt| receipt.created_contract().map(str::to_lowercase))
            .collect();

        let storage: DashMap<String, String> = DashMap::new();
        let bytecode: DashMap<String, String> = DashMap::new();
        futures::future::join_all(created.iter().map(|address| {
            let storage = &storage;
            let bytecode = &bytecode;
            async move {
                let (slot, code) = tokio::join!(
                    self.gateway
                        .get_storage_at(address, EIP1967_IMPLEMENTATION_SLOT, None),
                    self.gateway.get_code(address),
                );
                match slot {
                    Ok(value) => {
                        storage.insert(address.clone(), value);
                    }
                    Err(err) => {
                        tracing::error!(address = %address, error = %err, "failed to read implementation slot");
                    }
                }
                match code {
                    Ok(value) => {
                        bytecode.insert(address.clone(), value);
                    }
                    Err(err) => {
                        tracing::error!(address = %address, error = %err, "failed to fetch contract bytecode");
                    }
                }
            }
        }))
        .await;

        for receipt in receipts.values_mut() {
            if let Some(address) = receipt.created_contract().map(str::to_lowercase) {
                receipt.contract_bytecode = bytecode.get(&address).map(|code| code.value().clone());
            }
        }

        Ok(FetchedBlock {
            block,
            receipts,
            contract_storage: storage.into_iter().collect(),
        })
    }
}
