//! Operator share deltas per strategy, from the delegation manager.
//!
//! Every increase or decrease is stored as a signed delta. The state root is
//! computed over the net change per `(operator, strategy)` within the block.

use alloy::primitives::{B256, I256};
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use sidecar_data::store::Store;
use sidecar_data::types::TransactionLog;

use crate::accumulator::BlockAccumulator;
use crate::base::{output_field, required_address, value_as_decimal_string, InterestingLogs};
use crate::merkle::merkleize_state;
use crate::models::StateChange;
use crate::registry::StateModel;

pub const OPERATOR_SHARES_INCREASED: &str = "OperatorSharesIncreased";
pub const OPERATOR_SHARES_DECREASED: &str = "OperatorSharesDecreased";

const EVENTS: &[&str] = &[OPERATOR_SHARES_INCREASED, OPERATOR_SHARES_DECREASED];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorShareChange {
    pub operator: String,
    pub staker: String,
    pub strategy: String,
    /// Signed decimal; negative for decreases.
    pub shares: String,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
}

pub struct OperatorSharesModel {
    interesting: InterestingLogs,
    state: BlockAccumulator<OperatorShareChange>,
}

impl OperatorSharesModel {
    pub fn new(delegation_manager: &str) -> Self {
        Self {
            interesting: InterestingLogs::new(&[(delegation_manager, EVENTS)]),
            state: BlockAccumulator::new(),
        }
    }

    /// Net share change per `operator_strategy` slot for the block.
    pub fn net_changes(&self, block_number: u64) -> Result<BTreeMap<String, I256>> {
        let mut totals: BTreeMap<String, I256> = BTreeMap::new();
        for row in self.state.get(block_number)? {
            let delta = I256::from_dec_str(&row.shares)
                .map_err(|err| eyre!("invalid share delta {}: {err}", row.shares))?;
            let slot = format!("{}_{}", row.operator, row.strategy);
            let total = totals.entry(slot).or_insert(I256::ZERO);
            *total = total
                .checked_add(delta)
                .ok_or_else(|| eyre!("share total overflow for {}", row.operator))?;
        }
        Ok(totals)
    }
}

impl StateModel for OperatorSharesModel {
    fn name(&self) -> &'static str {
        "operator_shares"
    }

    fn table_name(&self) -> &'static str {
        "operator_share_changes"
    }

    fn setup_state_for_block(&mut self, block_number: u64) -> Result<()> {
        Ok(self.state.setup(block_number)?)
    }

    fn is_interesting_log(&self, log: &TransactionLog) -> bool {
        self.interesting.matches(log)
    }

    fn handle_transaction_log(&mut self, log: &TransactionLog) -> Result<StateChange> {
        let operator = required_address(log, 0, "operator")?;
        let strategy = output_field(log, "strategy")?
            .as_str()
            .ok_or_else(|| eyre!("strategy is not a string"))?
            .to_lowercase();
        let staker = output_field(log, "staker")?
            .as_str()
            .ok_or_else(|| eyre!("staker is not a string"))?
            .to_lowercase();
        let amount = value_as_decimal_string(output_field(log, "shares")?, "shares")?;
        let shares = if log.event_name == OPERATOR_SHARES_DECREASED && amount != "0" {
            format!("-{amount}")
        } else {
            amount
        };

        let change = OperatorShareChange {
            operator,
            staker,
            strategy,
            shares,
            transaction_hash: log.transaction_hash.clone(),
            log_index: log.log_index,
            block_number: log.block_number,
        };
        self.state.push(log.block_number, change.clone())?;
        Ok(StateChange::OperatorShares(change))
    }

    fn commit_final_state(&mut self, block_number: u64, store: &Store) -> Result<usize> {
        let rows = self.state.get(block_number)?;
        store.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "
                INSERT INTO operator_share_changes (
                    operator, staker, strategy, shares, transaction_hash, log_index, block_number
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for row in rows {
                stmt.execute(rusqlite::params![
                    row.operator,
                    row.staker,
                    row.strategy,
                    row.shares,
                    row.transaction_hash,
                    row.log_index,
                    row.block_number,
                ])?;
            }
            Ok(rows.len())
        })
    }

    fn generate_state_root(&self, block_number: u64) -> Result<Option<B256>> {
        let totals = self.net_changes(block_number)?;
        if totals.is_empty() {
            return Ok(None);
        }
        let slots: Vec<(String, Vec<u8>)> = totals
            .into_iter()
            .map(|(slot, total)| (slot, total.to_string().into_bytes()))
            .collect();
        merkleize_state(block_number, &slots).map(Some)
    }

    fn cleanup_processed_state_for_block(&mut self, block_number: u64) {
        self.state.cleanup(block_number);
    }
}
