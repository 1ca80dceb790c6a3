//! Staker share deltas per strategy.
//!
//! Four events move staker shares:
//!
//! - `Deposit` on the strategy manager adds shares.
//! - `ShareWithdrawalQueued` on the strategy manager removes them (M1).
//! - `WithdrawalQueued` on the delegation manager removes one delta per
//!   withdrawn strategy (M2).
//! - `PodSharesUpdated` on the eigenpod manager applies a signed delta to
//!   the beacon chain ETH strategy.
//!
//! Like operator shares, the state root covers the net change per
//! `(staker, strategy)` within the block.

use alloy::primitives::{B256, I256};
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use sidecar_data::store::Store;
use sidecar_data::types::TransactionLog;

use crate::accumulator::BlockAccumulator;
use crate::base::{
    output_field, required_address, string_field, value_as_decimal_string, value_as_signed_decimal,
    InterestingLogs,
};
use crate::merkle::merkleize_state;
use crate::models::StateChange;
use crate::registry::StateModel;

pub const DEPOSIT: &str = "Deposit";
pub const SHARE_WITHDRAWAL_QUEUED: &str = "ShareWithdrawalQueued";
pub const WITHDRAWAL_QUEUED: &str = "WithdrawalQueued";
pub const POD_SHARES_UPDATED: &str = "PodSharesUpdated";

/// Pseudo-strategy that native restaked ETH is accounted under.
pub const BEACON_CHAIN_ETH_STRATEGY: &str = "0xbeac0eeeeeeeeeeeeeeeeeeeeeeeeeeeeeebeac0";

const STRATEGY_MANAGER_EVENTS: &[&str] = &[DEPOSIT, SHARE_WITHDRAWAL_QUEUED];
const DELEGATION_MANAGER_EVENTS: &[&str] = &[WITHDRAWAL_QUEUED];
const EIGENPOD_MANAGER_EVENTS: &[&str] = &[POD_SHARES_UPDATED];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakerShareDelta {
    pub staker: String,
    pub strategy: String,
    /// Signed decimal; negative for withdrawals.
    pub shares: String,
    /// Position of `strategy` within a multi-strategy withdrawal.
    pub strategy_index: u64,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
}

pub struct StakerSharesModel {
    interesting: InterestingLogs,
    state: BlockAccumulator<StakerShareDelta>,
}

impl StakerSharesModel {
    pub fn new(strategy_manager: &str, delegation_manager: &str, eigenpod_manager: &str) -> Self {
        Self {
            interesting: InterestingLogs::new(&[
                (strategy_manager, STRATEGY_MANAGER_EVENTS),
                (delegation_manager, DELEGATION_MANAGER_EVENTS),
                (eigenpod_manager, EIGENPOD_MANAGER_EVENTS),
            ]),
            state: BlockAccumulator::new(),
        }
    }

    /// Net share change per `staker_strategy` slot for the block.
    pub fn net_changes(&self, block_number: u64) -> Result<BTreeMap<String, I256>> {
        let mut totals: BTreeMap<String, I256> = BTreeMap::new();
        for row in self.state.get(block_number)? {
            let delta = I256::from_dec_str(&row.shares)
                .map_err(|err| eyre!("invalid share delta {}: {err}", row.shares))?;
            let slot = format!("{}_{}", row.staker, row.strategy);
            let total = totals.entry(slot).or_insert(I256::ZERO);
            *total = total
                .checked_add(delta)
                .ok_or_else(|| eyre!("share total overflow for {}", row.staker))?;
        }
        Ok(totals)
    }

    fn delta(
        &self,
        log: &TransactionLog,
        staker: String,
        strategy: String,
        shares: String,
        index: u64,
    ) -> StakerShareDelta {
        StakerShareDelta {
            staker,
            strategy,
            shares,
            strategy_index: index,
            transaction_hash: log.transaction_hash.clone(),
            log_index: log.log_index,
            block_number: log.block_number,
        }
    }

    /// `Deposit` and `ShareWithdrawalQueued` carry the staker as `staker`
    /// or, before the M2 upgrade, as `depositor`.
    fn strategy_manager_delta(&self, log: &TransactionLog, negate: bool) -> Result<StakerShareDelta> {
        let staker = ["staker", "depositor"]
            .iter()
            .find_map(|field| log.output_data.get(*field).and_then(Value::as_str))
            .filter(|staker| !staker.is_empty())
            .map(str::to_lowercase)
            .ok_or_else(|| {
                eyre!(
                    "{} log {}:{} has no staker",
                    log.event_name,
                    log.transaction_hash,
                    log.log_index
                )
            })?;
        let strategy = output_field(log, "strategy")?
            .as_str()
            .ok_or_else(|| eyre!("strategy is not a string"))?
            .to_lowercase();
        let shares = value_as_decimal_string(output_field(log, "shares")?, "shares")?;
        Ok(self.delta(log, staker, strategy, negated(shares, negate), 0))
    }

    fn pod_shares_delta(&self, log: &TransactionLog) -> Result<StakerShareDelta> {
        let staker = required_address(log, 0, "podOwner")?;
        let shares = value_as_signed_decimal(output_field(log, "sharesDelta")?, "sharesDelta")?;
        Ok(self.delta(log, staker, BEACON_CHAIN_ETH_STRATEGY.to_string(), shares, 0))
    }

    fn queued_withdrawal_deltas(&self, log: &TransactionLog) -> Result<Vec<StakerShareDelta>> {
        let withdrawal = output_field(log, "withdrawal")?;
        let staker = string_field(withdrawal, "staker")?;
        let strategies = withdrawal
            .get("strategies")
            .and_then(Value::as_array)
            .ok_or_else(|| eyre!("withdrawal has no strategies"))?;
        let shares = withdrawal
            .get("shares")
            .and_then(Value::as_array)
            .ok_or_else(|| eyre!("withdrawal has no shares"))?;
        if strategies.len() != shares.len() {
            return Err(eyre!(
                "withdrawal lists {} strategies but {} share amounts",
                strategies.len(),
                shares.len()
            ));
        }

        strategies
            .iter()
            .zip(shares)
            .enumerate()
            .map(|(index, (strategy, amount))| {
                let strategy = strategy
                    .as_str()
                    .ok_or_else(|| eyre!("withdrawal strategy is not a string"))?
                    .to_lowercase();
                let amount = value_as_decimal_string(amount, "shares")?;
                Ok(self.delta(log, staker.clone(), strategy, negated(amount, true), index as u64))
            })
            .collect()
    }
}

fn negated(amount: String, negate: bool) -> String {
    if negate && amount != "0" {
        format!("-{amount}")
    } else {
        amount
    }
}

impl StateModel for StakerSharesModel {
    fn name(&self) -> &'static str {
        "staker_shares"
    }

    fn table_name(&self) -> &'static str {
        "staker_share_deltas"
    }

    fn setup_state_for_block(&mut self, block_number: u64) -> Result<()> {
        Ok(self.state.setup(block_number)?)
    }

    fn is_interesting_log(&self, log: &TransactionLog) -> bool {
        self.interesting.matches(log)
    }

    fn handle_transaction_log(&mut self, log: &TransactionLog) -> Result<StateChange> {
        let deltas = match log.event_name.as_str() {
            DEPOSIT => vec![self.strategy_manager_delta(log, false)?],
            SHARE_WITHDRAWAL_QUEUED => vec![self.strategy_manager_delta(log, true)?],
            POD_SHARES_UPDATED => vec![self.pod_shares_delta(log)?],
            WITHDRAWAL_QUEUED => self.queued_withdrawal_deltas(log)?,
            other => return Err(eyre!("unexpected staker shares event {other}")),
        };
        for delta in &deltas {
            self.state.push(log.block_number, delta.clone())?;
        }
        Ok(StateChange::StakerShares { deltas })
    }

    fn commit_final_state(&mut self, block_number: u64, store: &Store) -> Result<usize> {
        let rows = self.state.get(block_number)?;
        store.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "
                INSERT INTO staker_share_deltas (
                    staker, strategy, shares, strategy_index, transaction_hash, log_index, block_number
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for row in rows {
                stmt.execute(rusqlite::params![
                    row.staker,
                    row.strategy,
                    row.shares,
                    row.strategy_index,
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sidecar_data::types::LogArgument;

    const STRATEGY_MANAGER: &str = "0xdfb5f6ce42aaa7830e94ecfccad411bef4d4d5b6";
    const DELEGATION_MANAGER: &str = "0xa44151489861fe9e3055d95adc98fbd462b948e7";
    const EIGENPOD_MANAGER: &str = "0x30770d7e3e71112d7a6b7259542d1f680a70e315";
    const STAKER: &str = "0x3c42cd72639e3e8d11ab8d0072cc13bd5d8aa83c";
    const STRATEGY: &str = "0x7d704507b76571a51d9cae8addabbfd0ba0e63d3";
    const OTHER_STRATEGY: &str = "0x3a8fbdf9e77dfc25d09741f51d3e181b25d0c4e0";

    fn model() -> StakerSharesModel {
        StakerSharesModel::new(STRATEGY_MANAGER, DELEGATION_MANAGER, EIGENPOD_MANAGER)
    }

    fn log(
        address: &str,
        event_name: &str,
        log_index: u64,
        arguments: Vec<LogArgument>,
        output: Value,
    ) -> TransactionLog {
        TransactionLog {
            block_number: 1_477_020,
            transaction_hash: "0xstaker".to_string(),
            transaction_index: 0,
            log_index,
            address: address.to_string(),
            event_name: event_name.to_string(),
            arguments,
            output_data: output.as_object().cloned().expect("object literal"),
        }
    }

    #[test]
    fn deposits_and_m1_withdrawals_net_out() {
        let mut model = model();
        model.setup_state_for_block(1_477_020).expect("setup");

        model
            .handle_transaction_log(&log(
                STRATEGY_MANAGER,
                DEPOSIT,
                0,
                vec![],
                json!({"staker": STAKER.to_uppercase().replace("0X", "0x"), "token": "0x1", "strategy": STRATEGY, "shares": "502179505706314959"}),
            ))
            .expect("deposit");
        let change = model
            .handle_transaction_log(&log(
                STRATEGY_MANAGER,
                SHARE_WITHDRAWAL_QUEUED,
                1,
                vec![],
                json!({"depositor": STAKER, "nonce": 0, "strategy": STRATEGY, "shares": 2179505706314959u64}),
            ))
            .expect("m1 withdrawal");

        let StateChange::StakerShares { deltas } = change else {
            panic!("unexpected change {change:?}");
        };
        assert_eq!(deltas[0].shares, "-2179505706314959");
        assert_eq!(deltas[0].staker, STAKER);

        let totals = model.net_changes(1_477_020).expect("totals");
        assert_eq!(totals[&format!("{STAKER}_{STRATEGY}")].to_string(), "500000000000000000");
    }

    #[test]
    fn pod_shares_use_the_beacon_strategy() {
        let mut model = model();
        model.setup_state_for_block(1_477_020).expect("setup");

        let change = model
            .handle_transaction_log(&log(
                EIGENPOD_MANAGER,
                POD_SHARES_UPDATED,
                4,
                vec![LogArgument {
                    name: "podOwner".to_string(),
                    kind: "address".to_string(),
                    value: json!(STAKER),
                    indexed: true,
                }],
                json!({"sharesDelta": "-32000000000000000000"}),
            ))
            .expect("pod shares");

        let StateChange::StakerShares { deltas } = change else {
            panic!("unexpected change {change:?}");
        };
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].strategy, BEACON_CHAIN_ETH_STRATEGY);
        assert_eq!(deltas[0].shares, "-32000000000000000000");
    }

    #[test]
    fn m2_withdrawal_yields_one_delta_per_strategy() {
        let mut model = model();
        model.setup_state_for_block(1_477_020).expect("setup");

        let change = model
            .handle_transaction_log(&log(
                DELEGATION_MANAGER,
                WITHDRAWAL_QUEUED,
                7,
                vec![],
                json!({
                    "withdrawalRoot": "0x9f",
                    "withdrawal": {
                        "staker": STAKER,
                        "delegatedTo": "0x0000000000000000000000000000000000000000",
                        "withdrawer": STAKER,
                        "nonce": "0",
                        "startBlock": "1477020",
                        "strategies": [STRATEGY, OTHER_STRATEGY],
                        "shares": ["1000", "250"]
                    }
                }),
            ))
            .expect("m2 withdrawal");

        let StateChange::StakerShares { deltas } = change else {
            panic!("unexpected change {change:?}");
        };
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[1].strategy, OTHER_STRATEGY);
        assert_eq!(deltas[1].shares, "-250");
        assert_eq!(deltas[1].strategy_index, 1);
        assert!(model.generate_state_root(1_477_020).expect("root").is_some());
    }

    #[test]
    fn mismatched_withdrawal_arrays_are_rejected() {
        let mut model = model();
        model.setup_state_for_block(1_477_020).expect("setup");

        let result = model.handle_transaction_log(&log(
            DELEGATION_MANAGER,
            WITHDRAWAL_QUEUED,
            7,
            vec![],
            json!({"withdrawal": {"staker": STAKER, "strategies": [STRATEGY], "shares": []}}),
        ));
        assert!(result.is_err());
        assert!(model.state.get(1_477_020).expect("active").is_empty());
    }

    #[test]
    fn only_owning_contracts_are_interesting() {
        let model = model();
        let deposit = log(STRATEGY_MANAGER, DEPOSIT, 0, vec![], json!({}));
        let misplaced = log(DELEGATION_MANAGER, DEPOSIT, 0, vec![], json!({}));
        assert!(model.is_interesting_log(&deposit));
        assert!(!model.is_interesting_log(&misplaced));
    }
}
