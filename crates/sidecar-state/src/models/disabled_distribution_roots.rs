//! Distribution roots disabled by the rewards coordinator.

use alloy::primitives::B256;
use eyre::Result;
use serde::{Deserialize, Serialize};

use sidecar_data::store::Store;
use sidecar_data::types::TransactionLog;

use crate::accumulator::BlockAccumulator;
use crate::base::{slot_id, value_as_u64, InterestingLogs};
use crate::error::StateError;
use crate::merkle::merkleize_state;
use crate::models::StateChange;
use crate::registry::StateModel;

pub const DISTRIBUTION_ROOT_DISABLED: &str = "DistributionRootDisabled";

const EVENTS: &[&str] = &[DISTRIBUTION_ROOT_DISABLED];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisabledDistributionRoot {
    pub root_index: u64,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
}

pub struct DisabledDistributionRootsModel {
    interesting: InterestingLogs,
    state: BlockAccumulator<DisabledDistributionRoot>,
}

impl DisabledDistributionRootsModel {
    pub fn new(rewards_coordinator: &str) -> Self {
        Self {
            interesting: InterestingLogs::new(&[(rewards_coordinator, EVENTS)]),
            state: BlockAccumulator::new(),
        }
    }
}

impl StateModel for DisabledDistributionRootsModel {
    fn name(&self) -> &'static str {
        "disabled_distribution_roots"
    }

    fn table_name(&self) -> &'static str {
        "disabled_distribution_roots"
    }

    fn setup_state_for_block(&mut self, block_number: u64) -> Result<()> {
        Ok(self.state.setup(block_number)?)
    }

    fn is_interesting_log(&self, log: &TransactionLog) -> bool {
        self.interesting.matches(log)
    }

    fn handle_transaction_log(&mut self, log: &TransactionLog) -> Result<StateChange> {
        let record = DisabledDistributionRoot {
            root_index: value_as_u64(log.argument_value(0), "rootIndex")?,
            transaction_hash: log.transaction_hash.clone(),
            log_index: log.log_index,
            block_number: log.block_number,
        };

        let slot = slot_id(&record.transaction_hash, record.log_index);
        if self
            .state
            .get(log.block_number)?
            .iter()
            .any(|existing| slot_id(&existing.transaction_hash, existing.log_index) == slot)
        {
            return Err(StateError::DuplicateSlot(slot).into());
        }
        self.state.push(log.block_number, record.clone())?;
        Ok(StateChange::DisabledDistributionRoot(record))
    }

    fn commit_final_state(&mut self, block_number: u64, store: &Store) -> Result<usize> {
        let rows = self.state.get(block_number)?;
        store.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "
                INSERT INTO disabled_distribution_roots (
                    root_index, transaction_hash, log_index, block_number
                ) VALUES (?, ?, ?, ?)
                ",
            )?;
            for row in rows {
                stmt.execute(rusqlite::params![
                    row.root_index,
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
                    slot_id(&row.transaction_hash, row.log_index),
                    row.root_index.to_string().into_bytes(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sidecar_data::types::LogArgument;

    const COORDINATOR: &str = "0xacc1fb458a1317e886db376fc8141540537e68fe";

    fn disabled_log(log_index: u64, root_index: serde_json::Value) -> TransactionLog {
        TransactionLog {
            block_number: 2_100_000,
            transaction_hash: "0xdisable".to_string(),
            transaction_index: 0,
            log_index,
            address: COORDINATOR.to_string(),
            event_name: DISTRIBUTION_ROOT_DISABLED.to_string(),
            arguments: vec![LogArgument {
                name: "rootIndex".to_string(),
                kind: "uint32".to_string(),
                value: root_index,
                indexed: true,
            }],
            output_data: Default::default(),
        }
    }

    #[test]
    fn records_disabled_root_index() {
        let mut model = DisabledDistributionRootsModel::new(COORDINATOR);
        model.setup_state_for_block(2_100_000).expect("setup");

        let change = model
            .handle_transaction_log(&disabled_log(3, json!("12")))
            .expect("handled");
        assert_eq!(
            change,
            StateChange::DisabledDistributionRoot(DisabledDistributionRoot {
                root_index: 12,
                transaction_hash: "0xdisable".to_string(),
                log_index: 3,
                block_number: 2_100_000,
            })
        );

        let first = model.generate_state_root(2_100_000).expect("root");
        model
            .handle_transaction_log(&disabled_log(4, json!(13)))
            .expect("second");
        let second = model.generate_state_root(2_100_000).expect("root");
        assert!(first.is_some());
        assert_ne!(first, second);
    }

    #[test]
    fn missing_root_index_is_an_error() {
        let mut model = DisabledDistributionRootsModel::new(COORDINATOR);
        model.setup_state_for_block(2_100_000).expect("setup");
        assert!(model
            .handle_transaction_log(&disabled_log(3, serde_json::Value::Null))
            .is_err());
    }
}
