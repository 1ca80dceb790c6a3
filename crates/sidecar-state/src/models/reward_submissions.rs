//! Rewards submissions made to the rewards coordinator.
//!
//! One row per strategy of each submission. The submission struct is
//! named `rangePayment` in the events emitted before the rewards v1
//! rename and `rewardsSubmission` after it.

use alloy::primitives::B256;
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sidecar_data::store::Store;
use sidecar_data::types::TransactionLog;

use crate::accumulator::BlockAccumulator;
use crate::base::{
    output_field, required_address, string_field, value_as_decimal_string, value_as_hex, value_as_u64,
    InterestingLogs,
};
use crate::error::StateError;
use crate::merkle::merkleize_state;
use crate::models::StateChange;
use crate::registry::StateModel;

pub const RANGE_PAYMENT_CREATED: &str = "RangePaymentCreated";
pub const RANGE_PAYMENT_FOR_ALL_CREATED: &str = "RangePaymentForAllCreated";
pub const AVS_REWARDS_SUBMISSION_CREATED: &str = "AVSRewardsSubmissionCreated";
pub const REWARDS_SUBMISSION_FOR_ALL_CREATED: &str = "RewardsSubmissionForAllCreated";
pub const REWARDS_SUBMISSION_FOR_ALL_EARNERS_CREATED: &str = "RewardsSubmissionForAllEarnersCreated";

const EVENTS: &[&str] = &[
    RANGE_PAYMENT_CREATED,
    RANGE_PAYMENT_FOR_ALL_CREATED,
    AVS_REWARDS_SUBMISSION_CREATED,
    REWARDS_SUBMISSION_FOR_ALL_CREATED,
    REWARDS_SUBMISSION_FOR_ALL_EARNERS_CREATED,
];

/// Who a submission pays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardType {
    Avs,
    AllStakers,
    AllEarners,
}

impl RewardType {
    fn for_event(event_name: &str) -> Option<Self> {
        match event_name {
            RANGE_PAYMENT_CREATED | AVS_REWARDS_SUBMISSION_CREATED => Some(Self::Avs),
            RANGE_PAYMENT_FOR_ALL_CREATED | REWARDS_SUBMISSION_FOR_ALL_CREATED => Some(Self::AllStakers),
            REWARDS_SUBMISSION_FOR_ALL_EARNERS_CREATED => Some(Self::AllEarners),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Avs => "avs",
            Self::AllStakers => "all_stakers",
            Self::AllEarners => "all_earners",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSubmission {
    pub avs: String,
    pub reward_hash: String,
    pub token: String,
    pub amount: String,
    pub strategy: String,
    pub strategy_index: u64,
    pub multiplier: String,
    /// Unix seconds.
    pub start_timestamp: u64,
    /// `start_timestamp + duration`.
    pub end_timestamp: u64,
    pub duration: u64,
    pub reward_type: RewardType,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
}

impl RewardSubmission {
    pub fn slot_id(&self) -> String {
        format!(
            "{}_{:016x}_{}_{:016x}",
            self.transaction_hash, self.log_index, self.reward_hash, self.strategy_index
        )
    }
}

pub struct RewardSubmissionsModel {
    interesting: InterestingLogs,
    state: BlockAccumulator<RewardSubmission>,
}

impl RewardSubmissionsModel {
    pub fn new(rewards_coordinator: &str) -> Self {
        Self {
            interesting: InterestingLogs::new(&[(rewards_coordinator, EVENTS)]),
            state: BlockAccumulator::new(),
        }
    }

    fn parse_submissions(log: &TransactionLog) -> Result<Vec<RewardSubmission>> {
        let reward_type = RewardType::for_event(&log.event_name)
            .ok_or_else(|| eyre!("unexpected reward submission event {}", log.event_name))?;
        let field = match log.event_name.as_str() {
            RANGE_PAYMENT_CREATED | RANGE_PAYMENT_FOR_ALL_CREATED => "rangePayment",
            _ => "rewardsSubmission",
        };
        let submission = output_field(log, field)?;

        let avs = required_address(log, 0, "avs")?;
        let reward_hash = value_as_hex(log.argument_value(2), "rewardsSubmissionHash")?;
        let token = string_field(submission, "token")?;
        let amount = value_as_decimal_string(required(submission, "amount")?, "amount")?;
        let start_timestamp = value_as_u64(required(submission, "startTimestamp")?, "startTimestamp")?;
        let duration = value_as_u64(required(submission, "duration")?, "duration")?;
        let end_timestamp = start_timestamp
            .checked_add(duration)
            .ok_or_else(|| eyre!("submission end overflows: {start_timestamp} + {duration}"))?;

        let strategies = required(submission, "strategiesAndMultipliers")?
            .as_array()
            .ok_or_else(|| eyre!("strategiesAndMultipliers is not an array"))?;

        strategies
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                Ok(RewardSubmission {
                    avs: avs.clone(),
                    reward_hash: reward_hash.clone(),
                    token: token.clone(),
                    amount: amount.clone(),
                    strategy: string_field(entry, "strategy")?,
                    strategy_index: index as u64,
                    multiplier: value_as_decimal_string(required(entry, "multiplier")?, "multiplier")?,
                    start_timestamp,
                    end_timestamp,
                    duration,
                    reward_type,
                    transaction_hash: log.transaction_hash.clone(),
                    log_index: log.log_index,
                    block_number: log.block_number,
                })
            })
            .collect()
    }
}

fn required<'a>(object: &'a Value, field: &str) -> Result<&'a Value> {
    object
        .get(field)
        .ok_or_else(|| eyre!("reward submission has no {field}"))
}

impl StateModel for RewardSubmissionsModel {
    fn name(&self) -> &'static str {
        "reward_submissions"
    }

    fn table_name(&self) -> &'static str {
        "reward_submissions"
    }

    fn setup_state_for_block(&mut self, block_number: u64) -> Result<()> {
        Ok(self.state.setup(block_number)?)
    }

    fn is_interesting_log(&self, log: &TransactionLog) -> bool {
        self.interesting.matches(log)
    }

    fn handle_transaction_log(&mut self, log: &TransactionLog) -> Result<StateChange> {
        let submissions = Self::parse_submissions(log)?;

        let existing = self.state.get(log.block_number)?;
        for (index, submission) in submissions.iter().enumerate() {
            let slot = submission.slot_id();
            let clashes = existing
                .iter()
                .chain(&submissions[..index])
                .any(|row| row.slot_id() == slot);
            if clashes {
                return Err(StateError::DuplicateSlot(slot).into());
            }
        }
        for submission in &submissions {
            self.state.push(log.block_number, submission.clone())?;
        }
        Ok(StateChange::RewardSubmissions { submissions })
    }

    fn commit_final_state(&mut self, block_number: u64, store: &Store) -> Result<usize> {
        let rows = self.state.get(block_number)?;
        store.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "
                INSERT INTO reward_submissions (
                    avs, reward_hash, token, amount, strategy, strategy_index, multiplier,
                    start_timestamp, end_timestamp, duration, reward_type,
                    transaction_hash, log_index, block_number
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for row in rows {
                stmt.execute(rusqlite::params![
                    row.avs,
                    row.reward_hash,
                    row.token,
                    row.amount,
                    row.strategy,
                    row.strategy_index,
                    row.multiplier,
                    row.start_timestamp,
                    row.end_timestamp,
                    row.duration,
                    row.reward_type.as_str(),
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
            .map(|row| (row.slot_id(), b"added".to_vec()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        merkleize_state(block_number, &slots).map(Some)
    }

    fn cleanup_processed_state_for_block(&mut self, block_number: u64) {
        self.state.cleanup(block_number);
    }
}
