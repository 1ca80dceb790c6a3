//! Restaked-strategy reconciliation.
//!
//! For each AVS directory, every operator currently registered to an AVS is
//! asked (through the AVS's service manager) which strategies it has
//! restaked, as of the block. Calls run on a bounded worker pool and each
//! worker writes its own rows; a row already present is not an error.

use eyre::{eyre, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;

use sidecar_data::contract_caller::ContractCaller;
use sidecar_data::store::Store;
use sidecar_data::types::{ActiveAvsOperator, Block, OperatorRestakedStrategy};

/// Outcome of reconciling one block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// (avs, operator) pairs queried.
    pub pairs: usize,
    /// Rows newly written.
    pub inserted: usize,
    /// Rows that were already present.
    pub duplicates: usize,
}

pub struct RestakedStrategiesReconciler {
    store: Arc<Store>,
    caller: Arc<dyn ContractCaller>,
    workers: usize,
}

impl RestakedStrategiesReconciler {
    pub fn new(store: Arc<Store>, caller: Arc<dyn ContractCaller>, workers: usize) -> Self {
        Self {
            store,
            caller,
            workers: workers.max(1),
        }
    }

    /// Reconciles every directory in `avs_directories` for `block_number`.
    ///
    /// # Errors
    /// Returns error if the block is not indexed, a contract call fails or
    /// a write fails for any reason other than a duplicate row.
    #[tracing::instrument(skip(self, avs_directories))]
    pub async fn reconcile_block(&self, block_number: u64, avs_directories: &[String]) -> Result<ReconcileSummary> {
        let block = self
            .store
            .get_block_by_number(block_number)?
            .ok_or_else(|| eyre!("block {block_number} is not indexed"))?;

        let mut summary = ReconcileSummary::default();
        for directory in avs_directories {
            let partial = self.reconcile_directory(&block, directory).await?;
            summary.pairs += partial.pairs;
            summary.inserted += partial.inserted;
            summary.duplicates += partial.duplicates;
        }
        tracing::info!(
            block_number,
            pairs = summary.pairs,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            "reconciled restaked strategies"
        );
        Ok(summary)
    }

    /// Reconciles the operators registered in one AVS directory.
    ///
    /// # Errors
    /// Same as [`Self::reconcile_block`].
    pub async fn reconcile_directory(&self, block: &Block, avs_directory: &str) -> Result<ReconcileSummary> {
        let operators = self
            .store
            .get_latest_active_avs_operators(block.number, avs_directory)?;
        tracing::info!(
            block_number = block.number,
            avs_directory,
            operators = operators.len(),
            "found active AVS operators"
        );

        if let Some(invalid) = operators
            .iter()
            .find(|pair| pair.avs.is_empty() || pair.operator.is_empty())
        {
            return Err(eyre!("invalid AVS operator pair {invalid:?}"));
        }

        let block_time = chrono::DateTime::from_timestamp(block.block_time as i64, 0)
            .ok_or_else(|| eyre!("block {} has an invalid timestamp", block.number))?
            .to_rfc3339();

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(operators.len());
        for pair in operators.iter().cloned() {
            let semaphore = semaphore.clone();
            let store = self.store.clone();
            let caller = self.caller.clone();
            let block_number = block.number;
            let block_time = block_time.clone();
            let avs_directory = avs_directory.to_lowercase();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|err| eyre!("worker pool closed: {err}"))?;
                reconcile_pair(&*store, &*caller, &pair, block_number, &block_time, &avs_directory).await
            }));
        }

        let mut summary = ReconcileSummary {
            pairs: operators.len(),
            ..Default::default()
        };
        let mut failures = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok((inserted, duplicates))) => {
                    summary.inserted += inserted;
                    summary.duplicates += duplicates;
                }
                Ok(Err(err)) => failures.push(err),
                Err(err) => failures.push(eyre!("reconciliation worker panicked: {err}")),
            }
        }

        if let Some(first) = failures.into_iter().next() {
            return Err(first.wrap_err(format!(
                "failed to reconcile restaked strategies for {avs_directory} at block {}",
                block.number
            )));
        }
        Ok(summary)
    }
}

async fn reconcile_pair(
    store: &Store,
    caller: &dyn ContractCaller,
    pair: &ActiveAvsOperator,
    block_number: u64,
    block_time: &str,
    avs_directory: &str,
) -> Result<(usize, usize)> {
    let strategies = caller
        .get_operator_restaked_strategies(&pair.avs, &pair.operator, block_number)
        .await?;

    let mut inserted = 0;
    let mut duplicates = 0;
    for strategy in strategies {
        let row = OperatorRestakedStrategy {
            block_number,
            block_time: block_time.to_string(),
            avs_directory_address: avs_directory.to_string(),
            operator: pair.operator.clone(),
            avs: pair.avs.clone(),
            strategy: strategy.to_lowercase(),
        };
        if store.insert_operator_restaked_strategy(&row)? {
            inserted += 1;
        } else {
            tracing::debug!(avs = %pair.avs, operator = %pair.operator, strategy = %row.strategy, "restaked strategy already recorded");
            duplicates += 1;
        }
    }
    Ok((inserted, duplicates))
}
