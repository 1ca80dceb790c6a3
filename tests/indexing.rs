//! Integration tests for block fetching, the interesting-transaction filter
//! and log decoding.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use sidecar_data::chain::hash_bytecode;
use sidecar_index::{ContractResolver, Fetcher, Indexer};

use common::{
    address_topic, event_topic, registration_log, rewards_claimed_log, sample_block, sample_log, sample_receipt,
    sample_tx, test_config, tx_hash, Harness, AVS, CLAIMED_AMOUNT, OPERATOR, UNRELATED,
};

const CREATED: &str = "0x4ee8ffc1d8dac3f34e4a61d1b4bbd07cb9cd69a2";
const IMPLEMENTATION: &str = "0x5bf7ca6a8ba07d0a4ae8e1ab8eda0b6fd5d8a1a4";

fn indexer(harness: &Harness) -> Indexer {
    let resolver = Arc::new(ContractResolver::new(
        harness.store.clone(),
        harness.chain.clone(),
        harness.abis.clone(),
    ));
    Indexer::new(
        harness.store.clone(),
        Fetcher::new(harness.chain.clone()),
        resolver,
        harness.config.clone(),
    )
}

/// Receipts are matched to transactions by id even when the batch answers
/// out of order, and created contracts get their slot and code read.
#[tokio::test]
async fn fetcher_correlates_receipts_and_reads_created_contracts() {
    let harness = Harness::new(test_config());
    let block_number = 19_000_000;

    let transactions: Vec<_> = (0..4)
        .map(|i| sample_tx(&tx_hash(100 + i), Some(UNRELATED), block_number, i))
        .collect();
    let mut receipts: Vec<_> = transactions
        .iter()
        .map(|tx| sample_receipt(tx, Vec::new()))
        .collect();

    let mut creation = sample_tx(&tx_hash(200), None, block_number, 4);
    creation.input = "0x6080".to_string();
    let mut creation_receipt = sample_receipt(&creation, Vec::new());
    creation_receipt.contract_address = Some(CREATED.to_string());
    receipts.push(creation_receipt);

    let mut all = transactions.clone();
    all.push(creation.clone());
    harness
        .chain
        .add_block(sample_block(block_number, all), receipts);
    harness.chain.set_code(CREATED, "0x6080604052");
    harness
        .chain
        .set_storage(CREATED, &address_topic(IMPLEMENTATION));

    let fetched = Fetcher::new(harness.chain.clone())
        .fetch_block(block_number)
        .await
        .expect("block should fetch");

    assert_eq!(fetched.receipts.len(), 5);
    for tx in &transactions {
        let receipt = fetched.receipt(&tx.hash).expect("receipt present");
        assert_eq!(receipt.transaction_hash, tx.hash);
        assert_eq!(receipt.transaction_index, tx.transaction_index);
    }

    let created = fetched.receipt(&creation.hash).expect("creation receipt");
    assert_eq!(created.contract_bytecode.as_deref(), Some("0x6080604052"));
    assert_eq!(
        fetched.contract_storage.get(CREATED).map(String::as_str),
        Some(address_topic(IMPLEMENTATION).as_str())
    );
}

#[tokio::test]
async fn missing_block_is_an_error() {
    let harness = Harness::new(test_config());
    let err = Fetcher::new(harness.chain.clone())
        .fetch_block(1)
        .await
        .expect_err("unknown block");
    assert!(format!("{err:#}").contains("block 1"));
}

/// Only transactions touching a configured address, or carrying one of its
/// logs, survive the filter.
#[tokio::test]
async fn filters_interesting_transactions() {
    let harness = Harness::new(test_config());
    let block_number = 20_000_000;
    let coordinator = harness.config.contracts.rewards_coordinator.clone();
    let directory = harness.config.contracts.avs_directory.clone();

    let unrelated = sample_tx(&tx_hash(1), Some(UNRELATED), block_number, 0);
    let direct = sample_tx(&tx_hash(2), Some(&coordinator.to_uppercase().replace("0X", "0x")), block_number, 1);
    let routed = sample_tx(&tx_hash(3), Some(AVS), block_number, 2);

    let receipts = vec![
        sample_receipt(&unrelated, Vec::new()),
        sample_receipt(&direct, Vec::new()),
        sample_receipt(
            &routed,
            vec![registration_log(&routed, &directory, OPERATOR, AVS, 1, 5)],
        ),
    ];
    harness.chain.add_block(
        sample_block(block_number, vec![unrelated, direct.clone(), routed.clone()]),
        receipts,
    );

    let indexer = indexer(&harness);
    let fetched = Fetcher::new(harness.chain.clone())
        .fetch_block(block_number)
        .await
        .expect("fetch");

    let interesting: Vec<&str> = indexer
        .filter_interesting_transactions(&fetched)
        .into_iter()
        .map(|tx| tx.hash.as_str())
        .collect();
    assert_eq!(interesting, vec![direct.hash.as_str(), routed.hash.as_str()]);

    let parsed = indexer
        .parse_interesting_transactions_and_logs(&fetched)
        .await
        .expect("parse");
    assert_eq!(parsed.len(), 2);
    let routed_parsed = &parsed[1];
    assert_eq!(routed_parsed.logs.len(), 1);
    assert_eq!(routed_parsed.logs[0].event_name, "OperatorAVSRegistrationStatusUpdated");
    assert_eq!(routed_parsed.logs[0].arguments[0].value, serde_json::json!(OPERATOR));
    assert_eq!(routed_parsed.logs[0].output_data["status"], serde_json::json!("1"));
}

/// A log from a configured address without any known ABI is still kept,
/// named after its topic hash.
#[tokio::test]
async fn logs_without_abi_degrade_to_topic_hash() {
    let harness = Harness::new(test_config());
    let block_number = 20_000_001;
    let eigenpod_manager = harness.config.contracts.eigenpod_manager.clone();
    let topic = event_topic("PodDeployed(address,address)");

    let tx = sample_tx(&tx_hash(9), Some(&eigenpod_manager), block_number, 0);
    let log = sample_log(
        &tx,
        &eigenpod_manager,
        vec![topic.clone(), address_topic(UNRELATED), address_topic(OPERATOR)],
        "0x".to_string(),
        0,
    );
    harness
        .chain
        .add_block(sample_block(block_number, vec![tx.clone()]), vec![sample_receipt(&tx, vec![log])]);

    let indexer = indexer(&harness);
    let fetched = Fetcher::new(harness.chain.clone())
        .fetch_block(block_number)
        .await
        .expect("fetch");
    let parsed = indexer
        .parse_interesting_transactions_and_logs(&fetched)
        .await
        .expect("parse");

    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].method_name, "");
    assert_eq!(parsed[0].logs.len(), 1);
    assert_eq!(parsed[0].logs[0].event_name, topic);
    assert!(parsed[0].logs[0].arguments.is_empty());
    assert!(parsed[0].logs[0].output_data.is_empty());

    let contract = harness
        .store
        .get_contract(&eigenpod_manager)
        .expect("query")
        .expect("contract recorded on first sight");
    assert!(contract.checked_for_abi);
    assert!(!contract.verified);
}

/// Indexing a block twice leaves a single copy of every row.
#[tokio::test]
async fn indexing_is_idempotent() {
    let harness = Harness::new(test_config());
    let block_number = 20_535_362;
    harness.add_claim_block(block_number);
    let indexer = indexer(&harness);

    let first = indexer
        .fetch_and_index_block(block_number, false)
        .await
        .expect("first index");
    assert!(!first.already_indexed);
    let parsed = indexer
        .parse_interesting_transactions_and_logs(&first.fetched)
        .await
        .expect("parse");
    let (transactions, logs) = indexer
        .index_transactions_and_logs(&first.block, &parsed, false)
        .expect("write rows");
    assert_eq!((transactions, logs), (1, 1));

    let stored = harness
        .store
        .get_transaction_logs_for_block(block_number)
        .expect("logs");
    assert_eq!(stored[0].log_index, 270);
    assert_eq!(stored[0].event_name, "RewardsClaimed");
    assert_eq!(stored[0].output_data["claimedAmount"], serde_json::json!(CLAIMED_AMOUNT));
    assert_eq!(stored[0].arguments[3].value, serde_json::Value::Null);

    let second = indexer
        .fetch_and_index_block(block_number, false)
        .await
        .expect("second index");
    assert!(second.already_indexed);
    assert_eq!(second.block, first.block);

    let again = indexer
        .fetch_and_index_block(block_number, true)
        .await
        .expect("reindex");
    assert!(!again.already_indexed);
    let parsed = indexer
        .parse_interesting_transactions_and_logs(&again.fetched)
        .await
        .expect("parse");
    indexer
        .index_transactions_and_logs(&again.block, &parsed, true)
        .expect("rewrite rows");
    assert_eq!(harness.store.count_rows("transactions", block_number).expect("count"), 1);
    assert_eq!(harness.store.count_rows("transaction_logs", block_number).expect("count"), 1);
}

/// Contract creation rows carry the created address and its bytecode hash.
#[tokio::test]
async fn records_created_interesting_contract() {
    let harness = Harness::new(test_config());
    let block_number = 17_445_563;
    let strategy_manager = harness.config.contracts.strategy_manager.clone();
    let code = "0x608060405234801561001057600080fd5b50";

    let creation = sample_tx(&tx_hash(77), None, block_number, 0);
    let mut receipt = sample_receipt(&creation, Vec::new());
    receipt.contract_address = Some(strategy_manager.clone());
    harness
        .chain
        .add_block(sample_block(block_number, vec![creation.clone()]), vec![receipt]);
    harness.chain.set_code(&strategy_manager, code);

    let indexer = indexer(&harness);
    let indexed = indexer
        .fetch_and_index_block(block_number, false)
        .await
        .expect("index");
    let parsed = indexer
        .parse_interesting_transactions_and_logs(&indexed.fetched)
        .await
        .expect("parse");
    assert_eq!(parsed.len(), 1);

    let rows = indexer.transaction_rows(block_number, &parsed);
    assert_eq!(rows[0].to_address, None);
    assert_eq!(rows[0].contract_address.as_deref(), Some(strategy_manager.as_str()));
    assert_eq!(
        rows[0].bytecode_hash,
        Some(hash_bytecode(code).expect("hash"))
    );

    indexer
        .index_contracts_for_block(&indexed.block, &indexed.fetched, &parsed, false)
        .await;
    let contract = harness
        .store
        .get_contract(&strategy_manager)
        .expect("query")
        .expect("created contract stored");
    assert_eq!(contract.bytecode_hash, hash_bytecode(code).expect("hash"));
    assert!(contract.checked_for_proxy);
    assert!(harness.chain.code_reads.load(Ordering::SeqCst) >= 1);
}

/// A created contract whose slot read comes back short is still marked as
/// checked, so it is never treated as a pending proxy.
#[tokio::test]
async fn short_slot_value_marks_contract_checked() {
    let harness = Harness::new(test_config());
    let block_number = 17_445_600;
    let strategy_manager = harness.config.contracts.strategy_manager.clone();

    let creation = sample_tx(&tx_hash(78), None, block_number, 0);
    let mut receipt = sample_receipt(&creation, Vec::new());
    receipt.contract_address = Some(strategy_manager.clone());
    harness
        .chain
        .add_block(sample_block(block_number, vec![creation.clone()]), vec![receipt]);
    harness.chain.set_code(&strategy_manager, "0x6080604052");
    harness.chain.set_storage(&strategy_manager, "0x");

    let indexer = indexer(&harness);
    let indexed = indexer
        .fetch_and_index_block(block_number, false)
        .await
        .expect("index");
    let parsed = indexer
        .parse_interesting_transactions_and_logs(&indexed.fetched)
        .await
        .expect("parse");
    indexer
        .index_contracts_for_block(&indexed.block, &indexed.fetched, &parsed, false)
        .await;

    let contract = harness
        .store
        .get_contract(&strategy_manager)
        .expect("query")
        .expect("created contract stored");
    assert!(contract.checked_for_proxy);
    assert_eq!(harness.store.count_proxy_contracts(&strategy_manager).expect("count"), 0);
}

#[tokio::test]
async fn decodes_rewards_claim_fields() {
    let harness = Harness::new(test_config());
    let coordinator = harness.config.contracts.rewards_coordinator.clone();
    let tx = sample_tx(&tx_hash(5), Some(&coordinator), 1, 0);
    let log = rewards_claimed_log(&tx, &coordinator, 270);

    let abi = sidecar_index::decoder::parse_abi(common::REWARDS_COORDINATOR_ABI).expect("abi");
    let decoded = sidecar_index::decode_log(Some(&abi), &log).expect("decode");
    assert_eq!(decoded.event_name, "RewardsClaimed");
    assert_eq!(decoded.arguments.len(), 6);
    assert_eq!(decoded.arguments[1].value, serde_json::json!(common::EARNER));
    assert_eq!(decoded.arguments[3].value, serde_json::Value::Null);
    assert_eq!(decoded.output_data["root"], serde_json::json!(common::CLAIM_ROOT));
    assert_eq!(decoded.output_data["token"], serde_json::json!(common::TOKEN));
}
