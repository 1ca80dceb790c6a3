//! Rewards claimed against distribution roots.

use alloy::primitives::B256;
use eyre::Result;
use serde::{Deserialize, Serialize};

use sidecar_data::store::Store;
use sidecar_data::types::TransactionLog;

use crate::accumulator::BlockAccumulator;
use crate::base::{output_field, slot_id, value_as_decimal_string, value_as_hex, InterestingLogs};
use crate::merkle::merkleize_state;
use crate::models::StateChange;
use crate::registry::StateModel;

pub const REWARDS_CLAIMED: &str = "RewardsClaimed";

const EVENTS: &[&str] = &[REWARDS_CLAIMED];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardsClaimed {
    pub root: String,
    pub earner: String,
    pub claimer: String,
    /// Empty when the log carried no recipient.
    pub recipient: String,
    pub token: String,
    /// Decimal string.
    pub claimed_amount: String,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
}

pub struct RewardsClaimedModel {
    interesting: InterestingLogs,
    state: BlockAccumulator<RewardsClaimed>,
}

impl RewardsClaimedModel {
    pub fn new(rewards_coordinator: &str) -> Self {
        Self {
            interesting: InterestingLogs::new(&[(rewards_coordinator, EVENTS)]),
            state: BlockAccumulator::new(),
        }
    }
}

impl StateModel for RewardsClaimedModel {
    fn name(&self) -> &'static str {
        "rewards_claimed"
    }

    fn table_name(&self) -> &'static str {
        "rewards_claimed"
    }

    fn setup_state_for_block(&mut self, block_number: u64) -> Result<()> {
        Ok(self.state.setup(block_number)?)
    }

    fn is_interesting_log(&self, log: &TransactionLog) -> bool {
        self.interesting.matches(log)
    }

    fn handle_transaction_log(&mut self, log: &TransactionLog) -> Result<StateChange> {
        let token = output_field(log, "token")?
            .as_str()
            .unwrap_or_default()
            .to_lowercase();
        let record = RewardsClaimed {
            root: value_as_hex(output_field(log, "root")?, "root")?,
            earner: log.argument_str(1).unwrap_or_default(),
            claimer: log.argument_str(2).unwrap_or_default(),
            recipient: log.argument_str(3).unwrap_or_default(),
            token,
            claimed_amount: value_as_decimal_string(output_field(log, "claimedAmount")?, "claimedAmount")?,
            transaction_hash: log.transaction_hash.clone(),
            log_index: log.log_index,
            block_number: log.block_number,
        };
        self.state.push(log.block_number, record.clone())?;
        Ok(StateChange::RewardsClaimed(record))
    }

    fn commit_final_state(&mut self, block_number: u64, store: &Store) -> Result<usize> {
        let rows = self.state.get(block_number)?;
        store.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "
                INSERT INTO rewards_claimed (
                    root, earner, claimer, recipient, token, claimed_amount,
                    transaction_hash, log_index, block_number
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for row in rows {
                stmt.execute(rusqlite::params![
                    row.root,
                    row.earner,
                    row.claimer,
                    row.recipient,
                    row.token,
                    row.claimed_amount,
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
                    format!(
                        "{}:{}:{}:{}:{}:{}",
                        row.root, row.earner, row.claimer, row.recipient, row.token, row.claimed_amount
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
