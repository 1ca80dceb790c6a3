//! Operator registrations to AVSs, from the AVS directory.

use alloy::primitives::B256;
use eyre::Result;
use serde::{Deserialize, Serialize};

use sidecar_data::store::Store;
use sidecar_data::types::TransactionLog;

use crate::accumulator::BlockAccumulator;
use crate::base::{output_field, required_address, slot_id, value_as_u64, InterestingLogs};
use crate::merkle::merkleize_state;
use crate::models::StateChange;
use crate::registry::StateModel;

pub const REGISTRATION_STATUS_UPDATED: &str = "OperatorAVSRegistrationStatusUpdated";

const EVENTS: &[&str] = &[REGISTRATION_STATUS_UPDATED];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvsOperatorChange {
    pub operator: String,
    pub avs: String,
    pub registered: bool,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
}

pub struct AvsOperatorsModel {
    interesting: InterestingLogs,
    state: BlockAccumulator<AvsOperatorChange>,
}

impl AvsOperatorsModel {
    pub fn new(avs_directory: &str) -> Self {
        Self {
            interesting: InterestingLogs::new(&[(avs_directory, EVENTS)]),
            state: BlockAccumulator::new(),
        }
    }
}

impl StateModel for AvsOperatorsModel {
    fn name(&self) -> &'static str {
        "avs_operators"
    }

    fn table_name(&self) -> &'static str {
        "avs_operator_state_changes"
    }

    fn setup_state_for_block(&mut self, block_number: u64) -> Result<()> {
        Ok(self.state.setup(block_number)?)
    }

    fn is_interesting_log(&self, log: &TransactionLog) -> bool {
        self.interesting.matches(log)
    }

    fn handle_transaction_log(&mut self, log: &TransactionLog) -> Result<StateChange> {
        let status = value_as_u64(output_field(log, "status")?, "status")?;
        let change = AvsOperatorChange {
            operator: required_address(log, 0, "operator")?,
            avs: required_address(log, 1, "avs")?,
            registered: status == 1,
            transaction_hash: log.transaction_hash.clone(),
            log_index: log.log_index,
            block_number: log.block_number,
        };
        self.state.push(log.block_number, change.clone())?;
        Ok(StateChange::AvsOperator(change))
    }

    fn commit_final_state(&mut self, block_number: u64, store: &Store) -> Result<usize> {
        let rows = self.state.get(block_number)?;
        store.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "
                INSERT INTO avs_operator_state_changes (
                    operator, avs, registered, transaction_hash, log_index, block_number
                ) VALUES (?, ?, ?, ?, ?, ?)
                ",
            )?;
            for row in rows {
                stmt.execute(rusqlite::params![
                    row.operator,
                    row.avs,
                    row.registered,
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
                    format!("{}:{}:{}", row.avs, row.operator, row.registered).into_bytes(),
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
