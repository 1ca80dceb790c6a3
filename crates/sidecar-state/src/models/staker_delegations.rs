//! Staker → operator delegation changes, from the delegation manager.

use alloy::primitives::B256;
use eyre::Result;
use serde::{Deserialize, Serialize};

use sidecar_data::store::Store;
use sidecar_data::types::TransactionLog;

use crate::accumulator::BlockAccumulator;
use crate::base::{required_address, slot_id, InterestingLogs};
use crate::merkle::merkleize_state;
use crate::models::StateChange;
use crate::registry::StateModel;

pub const STAKER_DELEGATED: &str = "StakerDelegated";
pub const STAKER_UNDELEGATED: &str = "StakerUndelegated";

const EVENTS: &[&str] = &[STAKER_DELEGATED, STAKER_UNDELEGATED];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakerDelegationChange {
    pub staker: String,
    pub operator: String,
    pub delegated: bool,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
}

pub struct StakerDelegationsModel {
    interesting: InterestingLogs,
    state: BlockAccumulator<StakerDelegationChange>,
}

impl StakerDelegationsModel {
    pub fn new(delegation_manager: &str) -> Self {
        Self {
            interesting: InterestingLogs::new(&[(delegation_manager, EVENTS)]),
            state: BlockAccumulator::new(),
        }
    }
}

impl StateModel for StakerDelegationsModel {
    fn name(&self) -> &'static str {
        "staker_delegations"
    }

    fn table_name(&self) -> &'static str {
        "staker_delegation_changes"
    }

    fn setup_state_for_block(&mut self, block_number: u64) -> Result<()> {
        Ok(self.state.setup(block_number)?)
    }

    fn is_interesting_log(&self, log: &TransactionLog) -> bool {
        self.interesting.matches(log)
    }

    fn handle_transaction_log(&mut self, log: &TransactionLog) -> Result<StateChange> {
        let change = StakerDelegationChange {
            staker: required_address(log, 0, "staker")?,
            operator: required_address(log, 1, "operator")?,
            delegated: log.event_name == STAKER_DELEGATED,
            transaction_hash: log.transaction_hash.clone(),
            log_index: log.log_index,
            block_number: log.block_number,
        };
        self.state.push(log.block_number, change.clone())?;
        Ok(StateChange::StakerDelegation(change))
    }

    fn commit_final_state(&mut self, block_number: u64, store: &Store) -> Result<usize> {
        let rows = self.state.get(block_number)?;
        store.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "
                INSERT INTO staker_delegation_changes (
                    staker, operator, delegated, transaction_hash, log_index, block_number
                ) VALUES (?, ?, ?, ?, ?, ?)
                ",
            )?;
            for row in rows {
                stmt.execute(rusqlite::params![
                    row.staker,
                    row.operator,
                    row.delegated,
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
                    format!("{}:{}:{}", row.staker, row.operator, row.delegated).into_bytes(),
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

    const MANAGER: &str = "0xa44151489861fe9e3055d95adc98fbd462b948e7";

    fn delegation_log(event_name: &str, log_index: u64) -> TransactionLog {
        let address = |name: &str, value: &str| LogArgument {
            name: name.to_string(),
            kind: "address".to_string(),
            value: json!(value),
            indexed: true,
        };
        TransactionLog {
            block_number: 200,
            transaction_hash: "0xdelegation".to_string(),
            transaction_index: 3,
            log_index,
            address: MANAGER.to_string(),
            event_name: event_name.to_string(),
            arguments: vec![
                address("staker", "0x5fc0ac8e2d5d3a6b0a0f3c8f12b8a8d2e9f4e6a1"),
                address("operator", "0x5accc90436492f24e6af278569691e2c942a676d"),
            ],
            output_data: Default::default(),
        }
    }

    #[test]
    fn tracks_delegate_and_undelegate() {
        let mut model = StakerDelegationsModel::new(MANAGER);
        model.setup_state_for_block(200).expect("setup");

        let delegated = model
            .handle_transaction_log(&delegation_log(STAKER_DELEGATED, 0))
            .expect("delegated");
        let undelegated = model
            .handle_transaction_log(&delegation_log(STAKER_UNDELEGATED, 1))
            .expect("undelegated");

        assert!(matches!(delegated, StateChange::StakerDelegation(StakerDelegationChange { delegated: true, .. })));
        assert!(matches!(undelegated, StateChange::StakerDelegation(StakerDelegationChange { delegated: false, .. })));

        let store = Store::new(":memory:").expect("in-memory store should always open");
        assert_eq!(model.commit_final_state(200, &store).expect("commit"), 2);
    }

    #[test]
    fn missing_arguments_fail() {
        let mut model = StakerDelegationsModel::new(MANAGER);
        model.setup_state_for_block(200).expect("setup");
        let mut log = delegation_log(STAKER_DELEGATED, 0);
        log.arguments.truncate(1);
        assert!(model.handle_transaction_log(&log).is_err());
    }
}
