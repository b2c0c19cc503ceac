// test_suit/src/scenarios.rs
//
// Conformance scenarios runnable against any storage backend. Both the
// memory and Postgres adapters must pass the same sequence.
use serde_json::json;

use talanton::adapters::TransactionsQueryOptions;
use talanton::core::verify_chain;
use talanton::{
    AccountAddress, Amount, LedgerController, Metadata, Posting, QueryController, RevertOptions,
    TransactionData, TransactionInput,
};

fn posting(source: &str, destination: &str, amount: i64) -> Posting {
    Posting::new(
        AccountAddress::new(source).unwrap(),
        AccountAddress::new(destination).unwrap(),
        Amount::from(amount),
        "USD",
    )
}

fn input(postings: Vec<Posting>) -> TransactionInput {
    TransactionInput::Postings(TransactionData {
        postings,
        ..Default::default()
    })
}

async fn balance(queries: &QueryController, address: &str) -> Amount {
    queries
        .get_account(AccountAddress::new(address).unwrap(), None, true, false)
        .await
        .unwrap()
        .volumes
        .unwrap()
        .get("USD")
        .map(|v| v.balance())
        .unwrap_or_else(Amount::zero)
}

/// Commit, read, constrain, revert and export against one ledger.
pub async fn run_core_scenarios(controller: &LedgerController) {
    let queries = controller.queries();

    // lazily created accounts and exact balances
    let outcome = controller
        .create_transaction(input(vec![posting("world", "alice", 100)]), None)
        .await
        .unwrap();
    assert_eq!(outcome.transaction.id, 0);
    assert_eq!(balance(&queries, "alice").await, Amount::from(100));
    assert_eq!(balance(&queries, "world").await, Amount::from(-100));

    // bounded sources are enforced with details
    let err = controller
        .create_transaction(input(vec![posting("alice", "bob", 150)]), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_FUND");

    // references are unique
    let with_reference = TransactionInput::Postings(TransactionData {
        postings: vec![posting("world", "alice", 1)],
        reference: Some("r1".to_string()),
        ..Default::default()
    });
    controller
        .create_transaction(with_reference.clone(), None)
        .await
        .unwrap();
    let err = controller
        .create_transaction(with_reference, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");

    // idempotent replay
    let first = controller
        .create_transaction(
            input(vec![posting("world", "carol", 10)]),
            Some("suite-key".to_string()),
        )
        .await
        .unwrap();
    let replayed = controller
        .create_transaction(
            input(vec![posting("world", "carol", 10)]),
            Some("suite-key".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(first.transaction.id, replayed.transaction.id);

    // metadata round trip
    let alice = AccountAddress::new("alice").unwrap();
    controller
        .save_account_metadata(
            &alice,
            Metadata::from([("tier".to_string(), json!("gold"))]),
            None,
        )
        .await
        .unwrap();
    let account = queries
        .get_account(alice.clone(), None, false, false)
        .await
        .unwrap();
    assert_eq!(account.metadata.get("tier"), Some(&json!("gold")));

    // reversion marks the original and mirrors the postings
    let reverted = controller
        .revert_transaction(0, RevertOptions::default())
        .await
        .unwrap();
    assert_eq!(reverted.transaction.postings[0].source.as_str(), "alice");
    let original = queries.get_transaction(0, None).await.unwrap();
    assert!(original.reverted_at.is_some());
    let err = controller
        .revert_transaction(0, RevertOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ALREADY_REVERT");

    // the log is dense and hash-chained
    let logs = controller.export_logs().await.unwrap();
    for (i, log) in logs.iter().enumerate() {
        assert_eq!(log.id, i as u64);
    }
    verify_chain(&logs, 0, None).unwrap();

    let committed = queries
        .count_transactions(TransactionsQueryOptions::default())
        .await
        .unwrap();
    assert_eq!(committed as usize, 4);
}
