//! Per-block pipeline.
//!
//! `run_for_block` is the unit of work: fetch and index the block, feed its
//! decoded logs to the state models, reconcile restaked strategies on the
//! configured cadence, commit model state and write the block state root.
//! Blocks are processed strictly one after another.

use eyre::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use sidecar_data::abi_source::AbiSource;
use sidecar_data::chain::ChainGateway;
use sidecar_data::config::Config;
use sidecar_data::contract_caller::ContractCaller;
use sidecar_data::core_contracts::seed_core_contracts;
use sidecar_data::store::Store;
use sidecar_data::types::{Block, StateRoot};
use sidecar_state::StateRegistry;

use crate::chain_tip::ChainTip;
use crate::contracts::ContractResolver;
use crate::fetcher::Fetcher;
use crate::indexer::{Indexer, ParsedTransaction};
use crate::restaked_strategies::{ReconcileSummary, RestakedStrategiesReconciler};

/// What happened to one block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockOutcome {
    pub block_number: u64,
    /// The block was found in the store and skipped.
    pub already_indexed: bool,
    pub transactions: usize,
    pub logs: usize,
    pub state_changes: usize,
    pub state_root: Option<StateRoot>,
    pub restaked_strategies: Option<ReconcileSummary>,
}

pub struct Pipeline {
    store: Arc<Store>,
    indexer: Indexer,
    registry: StateRegistry,
    reconciler: RestakedStrategiesReconciler,
    config: Arc<Config>,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        indexer: Indexer,
        registry: StateRegistry,
        reconciler: RestakedStrategiesReconciler,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            indexer,
            registry,
            reconciler,
            config,
        }
    }

    /// Wires a pipeline with the default state models, after seeding the
    /// core contracts' built-in ABIs into `store`.
    ///
    /// # Errors
    /// Returns error if seeding fails or the state models cannot be
    /// registered.
    pub fn build(
        config: Arc<Config>,
        store: Arc<Store>,
        gateway: Arc<dyn ChainGateway>,
        abi_source: Arc<dyn AbiSource>,
        caller: Arc<dyn ContractCaller>,
    ) -> Result<Self> {
        seed_core_contracts(&store, &config.contracts)?;
        let resolver = Arc::new(ContractResolver::new(store.clone(), gateway.clone(), abi_source));
        let indexer = Indexer::new(store.clone(), Fetcher::new(gateway), resolver, config.clone());
        let registry = StateRegistry::with_default_models(&config)?;
        let reconciler =
            RestakedStrategiesReconciler::new(store.clone(), caller, config.restaked_strategies_workers);
        Ok(Self::new(store, indexer, registry, reconciler, config))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &StateRegistry {
        &self.registry
    }

    /// Runs block `block_number` through the pipeline.
    ///
    /// An already indexed block is skipped unless `reindex` is set, in which
    /// case its rows and derived state are rebuilt. On failure after the
    /// block row was written, the block is purged again so a retry starts
    /// from scratch.
    ///
    /// # Errors
    /// Returns error if any step before the state root is written fails.
    #[tracing::instrument(skip(self))]
    pub async fn run_for_block(&mut self, block_number: u64, reindex: bool) -> Result<BlockOutcome> {
        let indexed = self
            .indexer
            .fetch_and_index_block(block_number, reindex)
            .await
            .wrap_err_with(|| format!("failed to index block {block_number}"))?;

        if indexed.already_indexed {
            tracing::info!(block_number, "block already indexed");
            return Ok(BlockOutcome {
                block_number,
                already_indexed: true,
                ..Default::default()
            });
        }

        let result = self
            .process_indexed_block(&indexed.block, &indexed.fetched, reindex)
            .await;
        if let Err(err) = &result {
            tracing::error!(block_number, error = %err, "block processing failed");
            self.discard_block(block_number);
        }
        result
    }

    async fn process_indexed_block(
        &mut self,
        block: &Block,
        fetched: &crate::fetcher::FetchedBlock,
        reindex: bool,
    ) -> Result<BlockOutcome> {
        let block_number = block.number;
        if reindex {
            self.delete_block_state(block_number)?;
        }

        let parsed = self
            .indexer
            .parse_interesting_transactions_and_logs(fetched)
            .await
            .map_err(eyre::Report::new)?;
        let (transactions, logs) = self
            .indexer
            .index_transactions_and_logs(block, &parsed, reindex)?;
        self.indexer
            .index_contracts_for_block(block, fetched, &parsed, reindex)
            .await;

        self.registry.init_processing_for_block(block_number)?;
        let result = self.process_state(block, &parsed).await;
        self.registry.cleanup_processed_state_for_block(block_number);

        let (state_changes, state_root, restaked_strategies) = result?;
        tracing::info!(
            block_number,
            transactions,
            logs,
            state_changes,
            state_root = %state_root.state_root,
            "processed block"
        );
        Ok(BlockOutcome {
            block_number,
            already_indexed: false,
            transactions,
            logs,
            state_changes,
            state_root: Some(state_root),
            restaked_strategies,
        })
    }

    async fn process_state(
        &mut self,
        block: &Block,
        parsed: &[ParsedTransaction],
    ) -> Result<(usize, StateRoot, Option<ReconcileSummary>)> {
        let block_number = block.number;
        let mut state_changes = 0;
        for transaction in parsed {
            for log in transaction.transaction_logs(block_number) {
                state_changes += self.registry.handle_transaction_log(&log)?.len();
            }
            let upgraded = transaction.upgraded_logs();
            if !upgraded.is_empty() {
                tracing::debug!(
                    block_number,
                    transaction_hash = %transaction.transaction.hash,
                    count = upgraded.len(),
                    "found contract upgrade logs"
                );
                self.indexer
                    .index_contract_upgrades(block_number, &upgraded)
                    .await;
            }
        }

        let restaked = if self.config.is_restaked_strategies_block(block_number) {
            Some(self.reconcile_restaked_strategies(block_number).await?)
        } else {
            None
        };

        self.registry.commit_final_state(block_number, &self.store)?;
        let root = self.registry.generate_state_root(block_number, &block.hash)?;
        let state_root = self
            .registry
            .write_state_root(&self.store, block_number, &block.hash, root)?;
        Ok((state_changes, state_root, restaked))
    }

    /// Reconciles restaked strategies for an indexed block.
    ///
    /// # Errors
    /// Returns error if the block is not indexed or reconciliation fails.
    pub async fn reconcile_restaked_strategies(&self, block_number: u64) -> Result<ReconcileSummary> {
        self.reconciler
            .reconcile_block(block_number, &self.config.avs_directory_addresses())
            .await
    }

    /// Runs `start..=end` in order, stopping at the first failure.
    ///
    /// # Errors
    /// Returns the first block failure.
    pub async fn run_range(&mut self, start: u64, end: u64, reindex: bool) -> Result<u64> {
        let mut processed = 0;
        for block_number in start..=end {
            self.run_for_block(block_number, reindex).await?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Follows the chain from `start`, never running past `tip`. Only
    /// returns on failure.
    ///
    /// # Errors
    /// Returns the first block failure.
    pub async fn follow(&mut self, start: u64, tip: &ChainTip, poll_interval: Duration) -> Result<()> {
        let mut next = start;
        loop {
            let latest = tip.get().await;
            while next <= latest {
                self.run_for_block(next, false).await?;
                next += 1;
            }
            tracing::debug!(next, latest, "waiting for new blocks");
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Deletes derived state and state roots for `start..=end` (`end == 0`
    /// is open-ended).
    ///
    /// # Errors
    /// Returns error if the range is invalid or a delete fails.
    pub fn delete_corrupted_state(&self, start: u64, end: u64) -> Result<()> {
        self.registry.delete_corrupted_state(&self.store, start, end)
    }

    fn delete_block_state(&self, block_number: u64) -> Result<()> {
        self.registry.delete_state_for_block(&self.store, block_number)
    }

    fn discard_block(&self, block_number: u64) {
        if let Err(err) = self.store.delete_block(block_number) {
            tracing::error!(block_number, error = %err, "failed to purge block after failure");
        }
        if let Err(err) = self.delete_block_state(block_number) {
            tracing::error!(block_number, error = %err, "failed to purge state after failure");
        }
    }
}
