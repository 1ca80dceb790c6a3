//! Distribution roots submitted to the rewards coordinator.

use alloy::primitives::B256;
use eyre::Result;
use serde::{Deserialize, Serialize};

use sidecar_data::store::Store;
use sidecar_data::types::TransactionLog;

use crate::accumulator::BlockAccumulator;
use crate::base::{output_field, value_as_hex, value_as_u64, InterestingLogs};
use crate::error::StateError;
use crate::merkle::merkleize_state;
use crate::models::StateChange;
use crate::registry::StateModel;

pub const DISTRIBUTION_ROOT_SUBMITTED: &str = "DistributionRootSubmitted";

const EVENTS: &[&str] = &[DISTRIBUTION_ROOT_SUBMITTED];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedDistributionRoot {
    pub root: String,
    pub root_index: u64,
    pub rewards_calculation_end: u64,
    pub rewards_calculation_end_unit: String,
    pub activated_at: u64,
    pub activated_at_unit: String,
    pub created_at_block_number: u64,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
}

impl SubmittedDistributionRoot {
    pub fn slot_id(&self) -> String {
        format!("{}_{}", self.root, self.root_index)
    }
}

pub struct SubmittedDistributionRootsModel {
    interesting: InterestingLogs,
    state: BlockAccumulator<SubmittedDistributionRoot>,
}

impl SubmittedDistributionRootsModel {
    pub fn new(rewards_coordinator: &str) -> Self {
        Self {
            interesting: InterestingLogs::new(&[(rewards_coordinator, EVENTS)]),
            state: BlockAccumulator::new(),
        }
    }
}

impl StateModel for SubmittedDistributionRootsModel {
    fn name(&self) -> &'static str {
        "submitted_distribution_roots"
    }

    fn table_name(&self) -> &'static str {
        "submitted_distribution_roots"
    }

    fn setup_state_for_block(&mut self, block_number: u64) -> Result<()> {
        Ok(self.state.setup(block_number)?)
    }

    fn is_interesting_log(&self, log: &TransactionLog) -> bool {
        self.interesting.matches(log)
    }

    fn handle_transaction_log(&mut self, log: &TransactionLog) -> Result<StateChange> {
        let record = SubmittedDistributionRoot {
            root_index: value_as_u64(log.argument_value(0), "rootIndex")?,
            root: value_as_hex(log.argument_value(1), "root")?,
            rewards_calculation_end: value_as_u64(log.argument_value(2), "rewardsCalculationEndTimestamp")?,
            rewards_calculation_end_unit: "snapshot".to_string(),
            activated_at: value_as_u64(output_field(log, "activatedAt")?, "activatedAt")?,
            activated_at_unit: "timestamp".to_string(),
            created_at_block_number: log.block_number,
            transaction_hash: log.transaction_hash.clone(),
            log_index: log.log_index,
            block_number: log.block_number,
        };

        let slot = record.slot_id();
        if self
            .state
            .get(log.block_number)?
            .iter()
            .any(|existing| existing.slot_id() == slot)
        {
            return Err(StateError::DuplicateSlot(slot).into());
        }
        self.state.push(log.block_number, record.clone())?;
        Ok(StateChange::SubmittedDistributionRoot(record))
    }

    fn commit_final_state(&mut self, block_number: u64, store: &Store) -> Result<usize> {
        let rows = self.state.get(block_number)?;
        store.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "
                INSERT INTO submitted_distribution_roots (
                    root, root_index, rewards_calculation_end, rewards_calculation_end_unit,
                    activated_at, activated_at_unit, created_at_block_number,
                    transaction_hash, log_index, block_number
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for row in rows {
                stmt.execute(rusqlite::params![
                    row.root,
                    row.root_index,
                    row.rewards_calculation_end,
                    row.rewards_calculation_end_unit,
                    row.activated_at,
                    row.activated_at_unit,
                    row.created_at_block_number,
                    row.transaction_hash,
                    row.log_index,
                    row.block_number,
                ])?;
            }
            Ok(rows.len())
        })
    }

    fn generate_state_root(&self, block_number: u64) -> Result<Option<B256>> {
        let rows = self.state.get(block_number)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut slots: Vec<(String, Vec<u8>)> = rows
            .iter()
            .map(|row| {
                (
                    row.slot_id(),
                    format!(
                        "{}:{}:{}",
                        row.rewards_calculation_end, row.activated_at, row.created_at_block_number
                    )
                    .into_bytes(),
                )
            })
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        merkleize_state(block_number, &slots).map(Some)
    }

    fn cleanup_processed_state_for_block(&mut self, block_number: u64) {
        self.state.cleanup(block_number);
    }
}
