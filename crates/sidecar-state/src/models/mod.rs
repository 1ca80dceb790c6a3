//! Protocol state models.

pub mod avs_operators;
pub mod disabled_distribution_roots;
pub mod operator_shares;
pub mod reward_submissions;
pub mod rewards_claimed;
pub mod staker_delegations;
pub mod staker_shares;
pub mod submitted_distribution_roots;

use serde::{Deserialize, Serialize};

use avs_operators::AvsOperatorChange;
use disabled_distribution_roots::DisabledDistributionRoot;
use operator_shares::OperatorShareChange;
use reward_submissions::RewardSubmission;
use rewards_claimed::RewardsClaimed;
use staker_delegations::StakerDelegationChange;
use staker_shares::StakerShareDelta;
use submitted_distribution_roots::SubmittedDistributionRoot;

/// Rows derived from a single log by one model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum StateChange {
    AvsOperator(AvsOperatorChange),
    StakerDelegation(StakerDelegationChange),
    OperatorShares(OperatorShareChange),
    SubmittedDistributionRoot(SubmittedDistributionRoot),
    RewardsClaimed(RewardsClaimed),
    StakerShares { deltas: Vec<StakerShareDelta> },
    RewardSubmissions { submissions: Vec<RewardSubmission> },
    DisabledDistributionRoot(DisabledDistributionRoot),
}
