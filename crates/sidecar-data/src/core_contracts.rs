//! Built-in event ABIs for the protocol's core contracts.
//!
//! The state models depend on decoding these events, so their ABIs are
//! written to the store before the first block is processed instead of
//! being left to an explorer lookup that may be unconfigured, rate limited
//! or pointing at a proxy without a verified implementation.

use eyre::{Context, Result};
use serde_json::{json, Value};

use crate::config::ContractAddresses;
use crate::store::Store;

fn indexed(name: &str, ty: &str) -> Value {
    json!({ "name": name, "type": ty, "indexed": true })
}

fn field(name: &str, ty: &str) -> Value {
    json!({ "name": name, "type": ty, "indexed": false })
}

fn event(name: &str, inputs: Vec<Value>) -> Value {
    json!({ "type": "event", "name": name, "anonymous": false, "inputs": inputs })
}

fn upgraded() -> Value {
    event("Upgraded", vec![indexed("implementation", "address")])
}

/// The `RewardsSubmission` / `RangePayment` struct, as a tuple parameter.
fn submission(name: &str) -> Value {
    json!({
        "name": name,
        "type": "tuple",
        "indexed": false,
        "components": [
            {
                "name": "strategiesAndMultipliers",
                "type": "tuple[]",
                "components": [
                    { "name": "strategy", "type": "address" },
                    { "name": "multiplier", "type": "uint96" }
                ]
            },
            { "name": "token", "type": "address" },
            { "name": "amount", "type": "uint256" },
            { "name": "startTimestamp", "type": "uint32" },
            { "name": "duration", "type": "uint32" }
        ]
    })
}

fn submission_event(name: &str, submitter: &str, nonce: &str, hash: &str, payload: &str) -> Value {
    event(
        name,
        vec![
            indexed(submitter, "address"),
            indexed(nonce, "uint256"),
            indexed(hash, "bytes32"),
            submission(payload),
        ],
    )
}

fn rewards_coordinator_abi() -> Value {
    Value::Array(vec![
        event(
            "DistributionRootSubmitted",
            vec![
                indexed("rootIndex", "uint32"),
                indexed("root", "bytes32"),
                indexed("rewardsCalculationEndTimestamp", "uint32"),
                field("activatedAt", "uint32"),
            ],
        ),
        event("DistributionRootDisabled", vec![indexed("rootIndex", "uint32")]),
        event(
            "RewardsClaimed",
            vec![
                field("root", "bytes32"),
                indexed("earner", "address"),
                indexed("claimer", "address"),
                indexed("recipient", "address"),
                field("token", "address"),
                field("claimedAmount", "uint256"),
            ],
        ),
        submission_event(
            "AVSRewardsSubmissionCreated",
            "avs",
            "submissionNonce",
            "rewardsSubmissionHash",
            "rewardsSubmission",
        ),
        submission_event(
            "RewardsSubmissionForAllCreated",
            "submitter",
            "submissionNonce",
            "rewardsSubmissionHash",
            "rewardsSubmission",
        ),
        submission_event(
            "RewardsSubmissionForAllEarnersCreated",
            "tokenHopper",
            "submissionNonce",
            "rewardsSubmissionHash",
            "rewardsSubmission",
        ),
        submission_event("RangePaymentCreated", "avs", "paymentNonce", "rangePaymentHash", "rangePayment"),
        submission_event(
            "RangePaymentForAllCreated",
            "submitter",
            "paymentNonce",
            "rangePaymentHash",
            "rangePayment",
        ),
        upgraded(),
    ])
}

fn delegation_manager_abi() -> Value {
    let share_change = |name: &str| {
        event(
            name,
            vec![
                indexed("operator", "address"),
                field("staker", "address"),
                field("strategy", "address"),
                field("shares", "uint256"),
            ],
        )
    };
    Value::Array(vec![
        event(
            "StakerDelegated",
            vec![indexed("staker", "address"), indexed("operator", "address")],
        ),
        event(
            "StakerUndelegated",
            vec![indexed("staker", "address"), indexed("operator", "address")],
        ),
        share_change("OperatorSharesIncreased"),
        share_change("OperatorSharesDecreased"),
        event(
            "WithdrawalQueued",
            vec![
                field("withdrawalRoot", "bytes32"),
                json!({
                    "name": "withdrawal",
                    "type": "tuple",
                    "indexed": false,
                    "components": [
                        { "name": "staker", "type": "address" },
                        { "name": "delegatedTo", "type": "address" },
                        { "name": "withdrawer", "type": "address" },
                        { "name": "nonce", "type": "uint256" },
                        { "name": "startBlock", "type": "uint32" },
                        { "name": "strategies", "type": "address[]" },
                        { "name": "shares", "type": "uint256[]" }
                    ]
                }),
            ],
        ),
        upgraded(),
    ])
}

fn avs_directory_abi() -> Value {
    Value::Array(vec![
        event(
            "OperatorAVSRegistrationStatusUpdated",
            vec![
                indexed("operator", "address"),
                indexed("avs", "address"),
                field("status", "uint8"),
            ],
        ),
        upgraded(),
    ])
}

fn strategy_manager_abi() -> Value {
    Value::Array(vec![
        event(
            "Deposit",
            vec![
                field("staker", "address"),
                field("token", "address"),
                field("strategy", "address"),
                field("shares", "uint256"),
            ],
        ),
        event(
            "ShareWithdrawalQueued",
            vec![
                field("depositor", "address"),
                field("nonce", "uint96"),
                field("strategy", "address"),
                field("shares", "uint256"),
            ],
        ),
        upgraded(),
    ])
}

fn eigenpod_manager_abi() -> Value {
    Value::Array(vec![
        event(
            "PodSharesUpdated",
            vec![indexed("podOwner", "address"), field("sharesDelta", "int256")],
        ),
        upgraded(),
    ])
}

/// `(address, ABI JSON)` for every core contract of `contracts`.
pub fn core_contract_abis(contracts: &ContractAddresses) -> Vec<(String, String)> {
    [
        (&contracts.rewards_coordinator, rewards_coordinator_abi()),
        (&contracts.delegation_manager, delegation_manager_abi()),
        (&contracts.avs_directory, avs_directory_abi()),
        (&contracts.strategy_manager, strategy_manager_abi()),
        (&contracts.eigenpod_manager, eigenpod_manager_abi()),
    ]
    .into_iter()
    .map(|(address, abi)| (address.to_lowercase(), abi.to_string()))
    .collect()
}

/// Stores the built-in ABI of every core contract that has no ABI yet and
/// returns how many were written.
///
/// Seeded contracts are marked verified and checked for an ABI. Their
/// proxy slot is still read the first time they are seen.
///
/// # Errors
/// Returns error if the store rejects a contract.
pub fn seed_core_contracts(store: &Store, contracts: &ContractAddresses) -> Result<usize> {
    let mut seeded = 0;
    for (address, abi) in core_contract_abis(contracts) {
        let contract = store
            .find_or_create_contract(&address, "")
            .wrap_err_with(|| format!("failed to seed core contract {address}"))?;
        if !contract.contract_abi.is_empty() {
            continue;
        }
        store.set_contract_abi(&address, &abi, true)?;
        seeded += 1;
    }
    if seeded > 0 {
        tracing::info!(seeded, "seeded core contract ABIs");
    }
    Ok(seeded)
}
