//! Integration tests for proxy and lookalike resolution as seen by the
//! pipeline.

mod common;

use std::sync::atomic::Ordering;

use sidecar_index::ContractResolver;

use common::{
    address_topic, event_topic, sample_block, sample_log, sample_receipt, sample_tx, test_config, tx_hash, Harness,
    OPERATOR,
};

const IMPL_V1: &str = "0x1784be6401339fc0fedf7e9379409f5c1bfe9dda";
const IMPL_V2: &str = "0xa75112d1df37fa53a431525cd47a7d7facea7e73";
const TWIN: &str = "0x9d7ca22eaafbae1dd3fd1ffbcd3e2a5a1cd3bd26";
const STAKER: &str = "0x8e4f5d2cc2cb8b4d3fc0ab3c7e0a6f3c1f2b7a10";
const SHARED_CODE: &str = "0x6080604052348015600f57600080fd5b50";

/// Delegation manager implementation events.
const DELEGATION_ABI: &str = r#"[
    {"type":"event","name":"StakerDelegated","anonymous":false,"inputs":[
        {"name":"staker","type":"address","indexed":true},
        {"name":"operator","type":"address","indexed":true}
    ]},
    {"type":"event","name":"Upgraded","anonymous":false,"inputs":[
        {"name":"implementation","type":"address","indexed":true}
    ]}
]"#;

fn slot_word(address: &str) -> String {
    address_topic(address)
}

/// Adds a block whose only transaction calls the delegation manager and
/// emits `StakerDelegated`.
fn add_delegation_block(harness: &Harness, number: u64) {
    let manager = harness.config.contracts.delegation_manager.clone();
    let tx = sample_tx(&tx_hash(number), Some(&manager), number, 0);
    let log = sample_log(
        &tx,
        &manager,
        vec![
            event_topic("StakerDelegated(address,address)"),
            address_topic(STAKER),
            address_topic(OPERATOR),
        ],
        "0x".to_string(),
        0,
    );
    harness
        .chain
        .add_block(sample_block(number, vec![tx.clone()]), vec![sample_receipt(&tx, vec![log])]);
}

fn add_upgrade_block(harness: &Harness, number: u64, implementation: &str) {
    let manager = harness.config.contracts.delegation_manager.clone();
    let tx = sample_tx(&tx_hash(number), Some(&manager), number, 0);
    let log = sample_log(
        &tx,
        &manager,
        vec![event_topic("Upgraded(address)"), address_topic(implementation)],
        "0x".to_string(),
        3,
    );
    harness
        .chain
        .add_block(sample_block(number, vec![tx.clone()]), vec![sample_receipt(&tx, vec![log])]);
}

/// A seeded core contract still has its proxy slot resolved on first sight,
/// and exactly one proxy row is written for it.
#[tokio::test]
async fn proxy_logs_decode_through_implementation() {
    let harness = Harness::new(test_config());
    let manager = harness.config.contracts.delegation_manager.clone();
    harness.abis.set_abi(IMPL_V1, DELEGATION_ABI);
    harness.chain.set_storage(&manager, &slot_word(IMPL_V1));
    add_delegation_block(&harness, 19_492_759);

    let mut pipeline = harness.pipeline();
    let outcome = pipeline
        .run_for_block(19_492_759, false)
        .await
        .expect("block should process");
    assert_eq!(outcome.logs, 1);
    assert_eq!(outcome.state_changes, 1);

    let logs = harness
        .store
        .get_transaction_logs_for_block(19_492_759)
        .expect("logs");
    assert_eq!(logs[0].event_name, "StakerDelegated");
    assert_eq!(harness.store.count_rows("staker_delegation_changes", 19_492_759).expect("count"), 1);

    assert_eq!(harness.store.count_proxy_contracts(&manager).expect("count"), 1);
    let tree = contract_tree(&harness, &manager, 19_492_759);
    assert_eq!(tree.base_proxy_address, IMPL_V1);
    assert!(tree.base_abi.contains("StakerDelegated"));
    assert!(!tree.base_proxy_abi.is_empty());
}

/// A proxy whose implementation is unverified borrows the ABI of a verified
/// contract with identical bytecode.
#[tokio::test]
async fn unverified_implementation_uses_lookalike_abi() {
    let harness = Harness::new(test_config());
    let manager = harness.config.contracts.delegation_manager.clone();
    harness.abis.set_abi(TWIN, DELEGATION_ABI);
    harness.chain.set_code(TWIN, SHARED_CODE);
    harness.chain.set_code(IMPL_V1, SHARED_CODE);
    harness.chain.set_storage(&manager, &slot_word(IMPL_V1));

    let resolver = ContractResolver::new(harness.store.clone(), harness.chain.clone(), harness.abis.clone());
    let twin = resolver
        .create_contract(TWIN, "", false)
        .await
        .expect("twin contract");
    assert!(twin.verified);

    add_delegation_block(&harness, 19_500_000);
    let mut pipeline = harness.pipeline();
    pipeline
        .run_for_block(19_500_000, false)
        .await
        .expect("block should process");

    let implementation = harness
        .store
        .get_contract(IMPL_V1)
        .expect("query")
        .expect("implementation recorded");
    assert!(!implementation.verified);
    assert_eq!(implementation.matching_contract_address, TWIN);

    let tree = contract_tree(&harness, &manager, 19_500_000);
    assert_eq!(tree.base_proxy_like_address, TWIN);

    let logs = harness
        .store
        .get_transaction_logs_for_block(19_500_000)
        .expect("logs");
    assert_eq!(logs[0].event_name, "StakerDelegated");
}

/// `Upgraded` logs append proxy history; earlier blocks keep resolving to
/// the earlier implementation.
#[tokio::test]
async fn upgrades_append_proxy_history() {
    let harness = Harness::new(test_config());
    let manager = harness.config.contracts.delegation_manager.clone();
    harness.abis.set_abi(IMPL_V1, DELEGATION_ABI);
    harness.abis.set_abi(IMPL_V2, DELEGATION_ABI);
    harness.chain.set_storage(&manager, &slot_word(IMPL_V1));
    add_delegation_block(&harness, 100);
    add_upgrade_block(&harness, 101, IMPL_V2);

    let mut pipeline = harness.pipeline();
    pipeline.run_range(100, 101, false).await.expect("range");

    assert_eq!(harness.store.count_proxy_contracts(&manager).expect("count"), 2);
    let before = contract_tree(&harness, &manager, 100);
    let after = contract_tree(&harness, &manager, 101);
    assert_eq!(before.base_proxy_address, IMPL_V1);
    assert_eq!(after.base_proxy_address, IMPL_V2);

    let upgraded = harness
        .store
        .get_transaction_logs_for_block(101)
        .expect("logs");
    assert_eq!(upgraded[0].event_name, "Upgraded");

    // replaying the upgrade block does not duplicate history
    pipeline.run_for_block(101, true).await.expect("reindex");
    assert_eq!(harness.store.count_proxy_contracts(&manager).expect("count"), 2);
}

/// A contract seen before is not fetched from the chain or explorer again.
#[tokio::test]
async fn known_contracts_are_not_refetched() {
    let harness = Harness::new(test_config());
    let manager = harness.config.contracts.delegation_manager.clone();
    harness.abis.set_abi(IMPL_V1, DELEGATION_ABI);
    harness.chain.set_storage(&manager, &slot_word(IMPL_V1));
    add_delegation_block(&harness, 200);
    add_delegation_block(&harness, 201);

    let mut pipeline = harness.pipeline();
    pipeline.run_for_block(200, false).await.expect("first block");
    let lookups = harness.abis.lookups.load(Ordering::SeqCst);
    let storage_reads = harness.chain.storage_reads.load(Ordering::SeqCst);

    pipeline.run_for_block(201, false).await.expect("second block");
    assert_eq!(harness.abis.lookups.load(Ordering::SeqCst), lookups);
    assert_eq!(harness.chain.storage_reads.load(Ordering::SeqCst), storage_reads);
}

fn contract_tree(harness: &Harness, address: &str, block_number: u64) -> sidecar_data::ContractsTree {
    harness
        .store
        .get_contract_with_proxy_contract(address, block_number)
        .expect("query")
        .expect("contract tree")
}
