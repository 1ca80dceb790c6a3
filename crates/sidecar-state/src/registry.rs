//! State model registry.
//!
//! Drives every registered [`StateModel`] through the per-block lifecycle
//! `setup → handle* → commit → state root → cleanup` and combines the
//! per-model roots into a single block state root.

use alloy::primitives::B256;
use eyre::{eyre, Context, Result};

use sidecar_data::config::Config;
use sidecar_data::store::{is_duplicate_key_report, Store};
use sidecar_data::types::{StateRoot, TransactionLog};

use crate::error::StateError;
use crate::merkle::merkleize_block;
use crate::models::{
    avs_operators::AvsOperatorsModel, disabled_distribution_roots::DisabledDistributionRootsModel,
    operator_shares::OperatorSharesModel, reward_submissions::RewardSubmissionsModel,
    rewards_claimed::RewardsClaimedModel, staker_delegations::StakerDelegationsModel,
    staker_shares::StakerSharesModel, submitted_distribution_roots::SubmittedDistributionRootsModel,
    StateChange,
};

/// A plug-in that derives protocol state from decoded logs.
///
/// Models are driven by a single thread, one block at a time.
pub trait StateModel: Send {
    /// Stable name; feeds the block state root.
    fn name(&self) -> &'static str;

    /// Table holding the model's committed rows.
    fn table_name(&self) -> &'static str;

    /// Allocates the accumulator for `block_number`.
    ///
    /// # Errors
    /// Returns [`StateError::BlockAlreadyInitialized`] if it already exists.
    fn setup_state_for_block(&mut self, block_number: u64) -> Result<()>;

    fn is_interesting_log(&self, log: &TransactionLog) -> bool;

    /// Derives a row from `log` and adds it to the block accumulator.
    fn handle_transaction_log(&mut self, log: &TransactionLog) -> Result<StateChange>;

    /// Persists the accumulated rows for `block_number`.
    ///
    /// # Errors
    /// Returns [`StateError::BlockNotInitialized`] if the block was never
    /// set up, or the store error.
    fn commit_final_state(&mut self, block_number: u64, store: &Store) -> Result<usize>;

    /// Root over this block's rows, `None` when there are none.
    fn generate_state_root(&self, block_number: u64) -> Result<Option<B256>>;

    fn cleanup_processed_state_for_block(&mut self, block_number: u64);

    /// Deletes committed rows in `[start, end]`; `end == 0` is open-ended.
    fn delete_state(&self, store: &Store, start: u64, end: u64) -> Result<usize> {
        if end != 0 && end < start {
            return Err(StateError::InvalidBlockRange { start, end }.into());
        }
        store.delete_state(self.table_name(), start, end)
    }

    /// Deletes committed rows of exactly `block_number`.
    fn delete_state_for_block(&self, store: &Store, block_number: u64) -> Result<usize> {
        store.delete_state_at(self.table_name(), block_number)
    }
}

#[derive(Default)]
pub struct StateRegistry {
    models: Vec<Box<dyn StateModel>>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every protocol model for `config.chain`.
    pub fn with_default_models(config: &Config) -> Result<Self> {
        let contracts = &config.contracts;
        let mut registry = Self::new();
        registry.register_model(Box::new(AvsOperatorsModel::new(&contracts.avs_directory)))?;
        registry.register_model(Box::new(StakerDelegationsModel::new(&contracts.delegation_manager)))?;
        registry.register_model(Box::new(OperatorSharesModel::new(&contracts.delegation_manager)))?;
        registry.register_model(Box::new(SubmittedDistributionRootsModel::new(
            &contracts.rewards_coordinator,
        )))?;
        registry.register_model(Box::new(RewardsClaimedModel::new(&contracts.rewards_coordinator)))?;
        registry.register_model(Box::new(StakerSharesModel::new(
            &contracts.strategy_manager,
            &contracts.delegation_manager,
            &contracts.eigenpod_manager,
        )))?;
        registry.register_model(Box::new(RewardSubmissionsModel::new(&contracts.rewards_coordinator)))?;
        registry.register_model(Box::new(DisabledDistributionRootsModel::new(
            &contracts.rewards_coordinator,
        )))?;
        Ok(registry)
    }

    /// Appends `model`; registration order is commit and root order.
    ///
    /// # Errors
    /// Returns error if a model with the same name is already registered.
    pub fn register_model(&mut self, model: Box<dyn StateModel>) -> Result<()> {
        if self.models.iter().any(|m| m.name() == model.name()) {
            return Err(eyre!("state model {} is already registered", model.name()));
        }
        tracing::debug!(model = model.name(), "registered state model");
        self.models.push(model);
        Ok(())
    }

    pub fn model_names(&self) -> Vec<&'static str> {
        self.models.iter().map(|m| m.name()).collect()
    }

    /// Sets up every model for `block_number`. If any model fails, the
    /// block is cleaned up in all of them before the error is returned.
    pub fn init_processing_for_block(&mut self, block_number: u64) -> Result<()> {
        let setup = self.models.iter_mut().try_for_each(|model| {
            model
                .setup_state_for_block(block_number)
                .wrap_err_with(|| format!("failed to set up {} for block {block_number}", model.name()))
        });
        if setup.is_err() {
            self.cleanup_processed_state_for_block(block_number);
        }
        setup
    }

    /// Hands `log` to every model interested in it.
    pub fn handle_transaction_log(&mut self, log: &TransactionLog) -> Result<Vec<StateChange>> {
        let mut changes = Vec::new();
        for model in &mut self.models {
            if !model.is_interesting_log(log) {
                continue;
            }
            let change = model.handle_transaction_log(log).wrap_err_with(|| {
                format!(
                    "{} failed to handle {} at {}:{}",
                    model.name(),
                    log.event_name,
                    log.transaction_hash,
                    log.log_index
                )
            })?;
            tracing::debug!(
                model = model.name(),
                event_name = %log.event_name,
                transaction_hash = %log.transaction_hash,
                log_index = log.log_index,
                "handled log"
            );
            changes.push(change);
        }
        Ok(changes)
    }

    pub fn commit_final_state(&mut self, block_number: u64, store: &Store) -> Result<()> {
        for model in &mut self.models {
            let rows = model
                .commit_final_state(block_number, store)
                .wrap_err_with(|| format!("failed to commit {} for block {block_number}", model.name()))?;
            if rows > 0 {
                tracing::debug!(model = model.name(), block_number, rows, "committed state");
            }
        }
        Ok(())
    }

    /// Combines the per-model roots for `block_number`.
    pub fn generate_state_root(&self, block_number: u64, block_hash: &str) -> Result<B256> {
        let mut roots = Vec::with_capacity(self.models.len());
        for model in &self.models {
            let root = model
                .generate_state_root(block_number)
                .wrap_err_with(|| format!("failed to generate {} root", model.name()))?;
            if let Some(root) = root {
                roots.push((model.name(), root));
            }
        }
        merkleize_block(block_number, block_hash, &roots)
    }

    /// Persists the state root. An existing row for the same block hash is
    /// accepted when it holds the same root.
    pub fn write_state_root(
        &self,
        store: &Store,
        block_number: u64,
        block_hash: &str,
        root: B256,
    ) -> Result<StateRoot> {
        let state_root = StateRoot {
            eth_block_number: block_number,
            eth_block_hash: block_hash.to_string(),
            state_root: format!("{root:#x}"),
        };
        match store.insert_state_root(&state_root) {
            Ok(()) => Ok(state_root),
            Err(err) if is_duplicate_key_report(&err) => {
                let existing = store.get_state_root_for_block(block_number)?;
                match existing {
                    Some(existing) if existing == state_root => Ok(state_root),
                    Some(existing) => Err(eyre!(
                        "state root mismatch for block {block_number}: stored {} computed {}",
                        existing.state_root,
                        state_root.state_root
                    )),
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    pub fn cleanup_processed_state_for_block(&mut self, block_number: u64) {
        for model in &mut self.models {
            model.cleanup_processed_state_for_block(block_number);
        }
    }

    /// Deletes every model's rows and state roots in `[start, end]`.
    pub fn delete_corrupted_state(&self, store: &Store, start: u64, end: u64) -> Result<()> {
        for model in &self.models {
            let deleted = model
                .delete_state(store, start, end)
                .wrap_err_with(|| format!("failed to delete {} state", model.name()))?;
            tracing::info!(model = model.name(), start, end, deleted, "deleted state");
        }
        store.delete_state_roots(start, end)?;
        Ok(())
    }

    /// Deletes every model's rows and the state root of one block. Unlike
    /// [`Self::delete_corrupted_state`] this also works for block 0.
    pub fn delete_state_for_block(&self, store: &Store, block_number: u64) -> Result<()> {
        for model in &self.models {
            let deleted = model
                .delete_state_for_block(store, block_number)
                .wrap_err_with(|| format!("failed to delete {} state", model.name()))?;
            tracing::debug!(model = model.name(), block_number, deleted, "deleted block state");
        }
        store.delete_state_root_at(block_number)?;
        Ok(())
    }
}
