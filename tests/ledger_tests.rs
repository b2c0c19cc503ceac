// tests/ledger_tests.rs
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};

use talanton::adapters::memory::MemoryDriver;
use talanton::adapters::{
    AccountsQueryOptions, AggregatedBalancesQuery, BalanceReader, TransactionsQueryOptions,
    VolumesQueryOptions,
};
use talanton::core::verify_chain;
use talanton::engine::numscript::{NoScriptEvaluator, ScriptEvaluator, ScriptResult};
use talanton::error::{LedgerError, ScriptErrorKind};
use talanton::registry::features::{Feature, FeatureSet};
use talanton::{
    AccountAddress, Amount, Filter, LedgerConfig, LedgerController, Metadata, Posting,
    QueryController, Registry, RevertOptions, RunScript, TransactionData, TransactionInput,
};

async fn setup() -> (Registry, LedgerController, QueryController) {
    setup_with(LedgerConfig::default(), Arc::new(NoScriptEvaluator)).await
}

async fn setup_with(
    config: LedgerConfig,
    evaluator: Arc<dyn ScriptEvaluator>,
) -> (Registry, LedgerController, QueryController) {
    let registry = Registry::new(Arc::new(MemoryDriver::new()), evaluator);
    registry.create_ledger("l1", config).await.unwrap();
    let controller = registry.controller("l1").await.unwrap();
    let queries = controller.queries();
    (registry, controller, queries)
}

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
    let account = queries
        .get_account(AccountAddress::new(address).unwrap(), None, true, false)
        .await
        .unwrap();
    account
        .volumes
        .unwrap()
        .get("USD")
        .map(|v| v.balance())
        .unwrap_or_else(Amount::zero)
}

// ── S1: first posting creates accounts ────────────────────────────────────

#[tokio::test]
async fn first_posting_creates_account() {
    let (_registry, controller, queries) = setup().await;

    let outcome = controller
        .create_transaction(input(vec![posting("world", "alice", 100)]), None)
        .await
        .unwrap();
    assert_eq!(outcome.transaction.id, 0);

    assert_eq!(balance(&queries, "alice").await, Amount::from(100));
    assert_eq!(balance(&queries, "world").await, Amount::from(-100));
}

// ── S2: sufficient funds ──────────────────────────────────────────────────

#[tokio::test]
async fn insufficient_funds_carries_details() {
    let (_registry, controller, _queries) = setup().await;
    controller
        .create_transaction(input(vec![posting("world", "alice", 100)]), None)
        .await
        .unwrap();

    let err = controller
        .create_transaction(input(vec![posting("alice", "bob", 150)]), None)
        .await
        .unwrap_err();
    match err {
        LedgerError::InsufficientFund {
            account,
            asset,
            required,
            available,
        } => {
            assert_eq!(account, "alice");
            assert_eq!(asset, "USD");
            assert_eq!(required, Amount::from(150));
            assert_eq!(available, Amount::from(100));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn world_may_go_arbitrarily_negative() {
    let (_registry, controller, queries) = setup().await;
    for _ in 0..5 {
        controller
            .create_transaction(input(vec![posting("world", "alice", 1_000_000)]), None)
            .await
            .unwrap();
    }
    assert_eq!(balance(&queries, "world").await, Amount::from(-5_000_000));
}

#[tokio::test]
async fn earlier_postings_fund_later_ones_in_same_transaction() {
    let (_registry, controller, queries) = setup().await;
    controller
        .create_transaction(
            input(vec![posting("world", "alice", 100), posting("alice", "bob", 60)]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(balance(&queries, "alice").await, Amount::from(40));
    assert_eq!(balance(&queries, "bob").await, Amount::from(60));
}

// ── S3: reference conflict ────────────────────────────────────────────────

#[tokio::test]
async fn reference_conflict() {
    let (_registry, controller, _queries) = setup().await;
    let with_reference = |amount: i64| {
        TransactionInput::Postings(TransactionData {
            postings: vec![posting("world", "alice", amount)],
            reference: Some("r1".to_string()),
            ..Default::default()
        })
    };

    controller
        .create_transaction(with_reference(100), None)
        .await
        .unwrap();
    let err = controller
        .create_transaction(with_reference(50), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

// ── S4: idempotency ───────────────────────────────────────────────────────

#[tokio::test]
async fn idempotent_replay_returns_same_result() {
    let (_registry, controller, queries) = setup().await;

    let first = controller
        .create_transaction(
            input(vec![posting("world", "alice", 100)]),
            Some("k1".to_string()),
        )
        .await
        .unwrap();
    let replayed = controller
        .create_transaction(
            input(vec![posting("world", "alice", 100)]),
            Some("k1".to_string()),
        )
        .await
        .unwrap();

    assert_eq!(first.transaction.id, replayed.transaction.id);
    assert_eq!(first.log.id, replayed.log.id);
    assert_eq!(
        queries
            .count_transactions(TransactionsQueryOptions::default())
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn idempotency_key_with_different_body_rejected() {
    let (_registry, controller, _queries) = setup().await;
    controller
        .create_transaction(
            input(vec![posting("world", "alice", 100)]),
            Some("k1".to_string()),
        )
        .await
        .unwrap();

    let err = controller
        .create_transaction(
            input(vec![posting("world", "alice", 200)]),
            Some("k1".to_string()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "IDEMPOTENCY_VIOLATION");
}

// ── S5: reversion ─────────────────────────────────────────────────────────

#[tokio::test]
async fn revert_mirrors_postings_and_marks_original() {
    let (_registry, controller, queries) = setup().await;
    controller
        .create_transaction(input(vec![posting("world", "alice", 100)]), None)
        .await
        .unwrap();

    let reverted = controller
        .revert_transaction(0, RevertOptions::default())
        .await
        .unwrap();
    assert_eq!(reverted.transaction.postings[0].source.as_str(), "alice");
    assert_eq!(
        reverted.transaction.postings[0].destination.as_str(),
        "world"
    );

    let original = queries.get_transaction(0, None).await.unwrap();
    assert!(original.reverted_at.is_some());
    assert_eq!(balance(&queries, "alice").await, Amount::zero());

    let err = controller
        .revert_transaction(0, RevertOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyReverted(0)));
}

#[tokio::test]
async fn revert_respects_balances_unless_forced() {
    let (_registry, controller, _queries) = setup().await;
    controller
        .create_transaction(input(vec![posting("world", "alice", 100)]), None)
        .await
        .unwrap();
    // alice spends what she got, reverting tx 0 would overdraw her
    controller
        .create_transaction(input(vec![posting("alice", "bob", 100)]), None)
        .await
        .unwrap();

    let err = controller
        .revert_transaction(0, RevertOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_FUND");

    controller
        .revert_transaction(
            0,
            RevertOptions {
                force: true,
                at_effective_date: None,
            },
        )
        .await
        .unwrap();
}

// ── S6: point-in-time balances ────────────────────────────────────────────

#[tokio::test]
async fn pit_balance_bounds_on_effective_date() {
    let (_registry, controller, queries) = setup().await;
    let t1 = Utc::now();
    let t2 = t1 + Duration::hours(1);
    let t3 = t1 + Duration::hours(2);

    let at = |timestamp, amount| {
        TransactionInput::Postings(TransactionData {
            postings: vec![posting("world", "alice", amount)],
            timestamp: Some(timestamp),
            ..Default::default()
        })
    };
    controller.create_transaction(at(t1, 100), None).await.unwrap();
    controller.create_transaction(at(t3, 50), None).await.unwrap();

    let alice = AccountAddress::new("alice").unwrap();
    let account = queries
        .get_account(alice.clone(), Some(t2), true, false)
        .await
        .unwrap();
    assert_eq!(account.volumes.unwrap()["USD"].balance(), Amount::from(100));

    let account = queries
        .get_account(alice, Some(t3), true, false)
        .await
        .unwrap();
    assert_eq!(account.volumes.unwrap()["USD"].balance(), Amount::from(150));
}

#[tokio::test]
async fn pit_before_first_transaction_sees_nothing() {
    let (_registry, controller, queries) = setup().await;
    let before = Utc::now() - Duration::hours(1);
    controller
        .create_transaction(input(vec![posting("world", "alice", 100)]), None)
        .await
        .unwrap();

    let accounts = queries
        .list_accounts(
            AccountsQueryOptions {
                pit: Some(before),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert!(accounts.data.is_empty());

    let balances = queries
        .get_aggregated_balances(AggregatedBalancesQuery {
            pit: Some(before),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(balances.is_empty() || balances.values().all(|v| v.balance().is_zero()));
}

#[tokio::test]
async fn backdated_commit_restores_effective_trail() {
    let (_registry, controller, queries) = setup().await;
    let t1 = Utc::now();
    let t2 = t1 + Duration::hours(1);
    let t3 = t1 + Duration::hours(2);

    let at = |timestamp, amount| {
        TransactionInput::Postings(TransactionData {
            postings: vec![posting("world", "alice", amount)],
            timestamp: Some(timestamp),
            ..Default::default()
        })
    };
    controller.create_transaction(at(t1, 100), None).await.unwrap();
    controller.create_transaction(at(t3, 50), None).await.unwrap();
    // back-dated into the middle
    controller.create_transaction(at(t2, 7), None).await.unwrap();

    let alice = AccountAddress::new("alice").unwrap();
    let account = queries
        .get_account(alice.clone(), Some(t2), false, true)
        .await
        .unwrap();
    assert_eq!(
        account.effective_volumes.unwrap()["USD"].balance(),
        Amount::from(107)
    );
    let account = queries
        .get_account(alice, Some(t3), false, true)
        .await
        .unwrap();
    assert_eq!(
        account.effective_volumes.unwrap()["USD"].balance(),
        Amount::from(157)
    );
}

// ── S7: concurrency ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commits_keep_invariants() {
    let (_registry, controller, queries) = setup().await;

    let mut workers = Vec::new();
    for worker in 0..10u64 {
        let controller = controller.clone();
        workers.push(tokio::spawn(async move {
            for i in 0..100u64 {
                let source = format!("world/{}", worker);
                let destination = format!("users/{}", (worker * 100 + i) % 17);
                controller
                    .create_transaction(
                        input(vec![posting(&source, &destination, 1 + (i as i64 % 7))]),
                        None,
                    )
                    .await
                    .unwrap();
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    // conservation: everything nets to zero per asset
    let balances = queries
        .get_aggregated_balances(AggregatedBalancesQuery::default())
        .await
        .unwrap();
    assert!(balances["USD"].balance().is_zero());

    // dense log ids and an unbroken hash chain
    let logs = controller.export_logs().await.unwrap();
    assert_eq!(logs.len(), 1000);
    for (i, log) in logs.iter().enumerate() {
        assert_eq!(log.id, i as u64);
    }
    verify_chain(&logs, 0, None).unwrap();

    // dense transaction ids
    assert_eq!(
        queries
            .count_transactions(TransactionsQueryOptions::default())
            .await
            .unwrap(),
        1000
    );
}

// ── Validation boundaries ─────────────────────────────────────────────────

#[tokio::test]
async fn validation_boundaries() {
    let (_registry, controller, _queries) = setup().await;

    let err = controller
        .create_transaction(input(vec![]), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NO_POSTINGS");

    let err = controller
        .create_transaction(input(vec![posting("world", "alice", 0)]), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION");

    let err = controller
        .create_transaction(input(vec![posting("alice", "alice", 5)]), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION");
}

#[tokio::test]
async fn timestamps_must_not_regress_without_effective_volumes() {
    let config = LedgerConfig {
        features: Some(
            FeatureSet::minimal()
                .with_feature(Feature::MovesHistory, "ON")
                .with_feature(Feature::HashLogs, "SYNC"),
        ),
        ..Default::default()
    };
    let (_registry, controller, _queries) =
        setup_with(config, Arc::new(NoScriptEvaluator)).await;

    let t1 = Utc::now();
    let t0 = t1 - Duration::hours(1);
    let at = |timestamp| {
        TransactionInput::Postings(TransactionData {
            postings: vec![posting("world", "alice", 10)],
            timestamp: Some(timestamp),
            ..Default::default()
        })
    };

    controller.create_transaction(at(t1), None).await.unwrap();
    let err = controller.create_transaction(at(t0), None).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_TIMESTAMP");
}

#[tokio::test]
async fn missing_features_are_reported() {
    let config = LedgerConfig {
        features: Some(FeatureSet::minimal()),
        ..Default::default()
    };
    let (_registry, _controller, queries) =
        setup_with(config, Arc::new(NoScriptEvaluator)).await;

    let err = queries
        .get_account(AccountAddress::new("alice").unwrap(), None, true, false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "MISSING_FEATURE");

    let err = queries
        .list_accounts(
            AccountsQueryOptions {
                filter: Some(Filter::gte("balance[USD]", 10)),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "MISSING_FEATURE");
}

#[tokio::test]
async fn invalid_filters_are_reported() {
    let (_registry, _controller, queries) = setup().await;
    let err = queries
        .list_accounts(
            AccountsQueryOptions {
                filter: Some(Filter::match_("nope", "x")),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_QUERY");
}

// ── Metadata ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn metadata_update_is_idempotent_for_updated_at() {
    let (_registry, controller, queries) = setup().await;
    let alice = AccountAddress::new("alice").unwrap();
    controller
        .create_transaction(input(vec![posting("world", "alice", 100)]), None)
        .await
        .unwrap();

    let metadata = Metadata::from([("tier".to_string(), json!("gold"))]);
    controller
        .save_account_metadata(&alice, metadata.clone(), None)
        .await
        .unwrap();
    let first = queries
        .get_account(alice.clone(), None, false, false)
        .await
        .unwrap();

    controller
        .save_account_metadata(&alice, metadata, None)
        .await
        .unwrap();
    let second = queries
        .get_account(alice.clone(), None, false, false)
        .await
        .unwrap();

    assert_eq!(first.updated_at, second.updated_at);
    assert_eq!(second.metadata.get("tier"), Some(&json!("gold")));
}

#[tokio::test]
async fn transaction_metadata_lifecycle() {
    let (_registry, controller, queries) = setup().await;
    controller
        .create_transaction(input(vec![posting("world", "alice", 100)]), None)
        .await
        .unwrap();

    controller
        .save_transaction_metadata(
            0,
            Metadata::from([("invoice".to_string(), json!("F-1"))]),
            None,
        )
        .await
        .unwrap();
    let tx = queries.get_transaction(0, None).await.unwrap();
    assert_eq!(tx.metadata.get("invoice"), Some(&json!("F-1")));

    controller
        .delete_transaction_metadata(0, "invoice", None)
        .await
        .unwrap();
    let tx = queries.get_transaction(0, None).await.unwrap();
    assert!(tx.metadata.get("invoice").is_none());
}

#[tokio::test]
async fn pit_metadata_honors_history() {
    let (_registry, controller, queries) = setup().await;
    let alice = AccountAddress::new("alice").unwrap();
    controller
        .create_transaction(input(vec![posting("world", "alice", 100)]), None)
        .await
        .unwrap();

    controller
        .save_account_metadata(
            &alice,
            Metadata::from([("tier".to_string(), json!("silver"))]),
            None,
        )
        .await
        .unwrap();
    let between = Utc::now();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    controller
        .save_account_metadata(
            &alice,
            Metadata::from([("tier".to_string(), json!("gold"))]),
            None,
        )
        .await
        .unwrap();

    let account = queries
        .get_account(alice.clone(), Some(between), false, false)
        .await
        .unwrap();
    assert_eq!(account.metadata.get("tier"), Some(&json!("silver")));

    let account = queries.get_account(alice, None, false, false).await.unwrap();
    assert_eq!(account.metadata.get("tier"), Some(&json!("gold")));
}

// ── Filters and pagination ────────────────────────────────────────────────

#[tokio::test]
async fn address_filters_anchor_on_segments() {
    let (_registry, controller, queries) = setup().await;
    for destination in ["users/1/wallet", "users/2/wallet", "orders/9"] {
        controller
            .create_transaction(input(vec![posting("world", destination, 10)]), None)
            .await
            .unwrap();
    }

    let matched = queries
        .list_accounts(
            AccountsQueryOptions {
                filter: Some(Filter::match_("address", "users/")),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    let addresses: Vec<_> = matched
        .data
        .iter()
        .map(|a| a.address.as_str().to_string())
        .collect();
    assert_eq!(addresses, vec!["users/1/wallet", "users/2/wallet"]);
}

#[tokio::test]
async fn balance_filters_and_metadata_filters() {
    let (_registry, controller, queries) = setup().await;
    controller
        .create_transaction(input(vec![posting("world", "alice", 100)]), None)
        .await
        .unwrap();
    controller
        .create_transaction(input(vec![posting("world", "bob", 5)]), None)
        .await
        .unwrap();
    controller
        .save_account_metadata(
            &AccountAddress::new("alice").unwrap(),
            Metadata::from([("tier".to_string(), json!("gold"))]),
            None,
        )
        .await
        .unwrap();

    let rich = queries
        .list_accounts(
            AccountsQueryOptions {
                filter: Some(Filter::and(vec![
                    Filter::gte("balance[USD]", 50),
                    Filter::match_("metadata[tier]", "gold"),
                ])),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(rich.data.len(), 1);
    assert_eq!(rich.data[0].address.as_str(), "alice");

    let with_tier = queries
        .count_accounts(AccountsQueryOptions {
            filter: Some(Filter::exists("metadata", "tier")),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(with_tier, 1);
}

#[tokio::test]
async fn transactions_filters() {
    let (_registry, controller, queries) = setup().await;
    controller
        .create_transaction(
            TransactionInput::Postings(TransactionData {
                postings: vec![posting("world", "alice", 100)],
                reference: Some("r1".to_string()),
                ..Default::default()
            }),
            None,
        )
        .await
        .unwrap();
    controller
        .create_transaction(input(vec![posting("alice", "bob", 25)]), None)
        .await
        .unwrap();

    let by_reference = queries
        .list_transactions(
            TransactionsQueryOptions {
                filter: Some(Filter::match_("reference", "r1")),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(by_reference.data.len(), 1);
    assert_eq!(by_reference.data[0].id, 0);

    let from_alice = queries
        .list_transactions(
            TransactionsQueryOptions {
                filter: Some(Filter::match_("source", "alice")),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(from_alice.data.len(), 1);
    assert_eq!(from_alice.data[0].id, 1);

    let not_reverted = queries
        .count_transactions(TransactionsQueryOptions {
            filter: Some(Filter::match_("reverted", false)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(not_reverted, 2);
}

#[tokio::test]
async fn cursor_pagination_walks_the_whole_set() {
    let (_registry, controller, queries) = setup().await;
    for i in 0..7 {
        let destination = format!("users/{}", i);
        controller
            .create_transaction(input(vec![posting("world", &destination, 10)]), None)
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = queries
            .list_accounts(
                AccountsQueryOptions {
                    filter: Some(Filter::match_("address", "users/")),
                    ..Default::default()
                },
                Some(3),
                cursor.as_deref(),
            )
            .await
            .unwrap();
        seen.extend(
            page.data
                .iter()
                .map(|a| a.address.as_str().to_string()),
        );
        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(seen.len(), 7);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

// ── Volumes ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn volumes_with_balances_groups_addresses() {
    let (_registry, controller, queries) = setup().await;
    controller
        .create_transaction(input(vec![posting("world", "users/1/wallet", 10)]), None)
        .await
        .unwrap();
    controller
        .create_transaction(input(vec![posting("world", "users/2/wallet", 15)]), None)
        .await
        .unwrap();

    let grouped = queries
        .get_volumes_with_balances(
            VolumesQueryOptions {
                group_by: Some(1),
                filter: Some(Filter::match_("address", "users/")),
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(grouped.data.len(), 1);
    assert_eq!(grouped.data[0].account, "users");
    assert_eq!(grouped.data[0].balance, Amount::from(25));
}

// ── Export / import ───────────────────────────────────────────────────────

#[tokio::test]
async fn export_import_round_trip() {
    let (registry, controller, queries) = setup().await;
    let alice = AccountAddress::new("alice").unwrap();

    controller
        .create_transaction(input(vec![posting("world", "alice", 100)]), None)
        .await
        .unwrap();
    controller
        .save_account_metadata(
            &alice,
            Metadata::from([("tier".to_string(), json!("gold"))]),
            None,
        )
        .await
        .unwrap();
    controller
        .create_transaction(input(vec![posting("alice", "bob", 30)]), None)
        .await
        .unwrap();
    controller
        .revert_transaction(1, RevertOptions::default())
        .await
        .unwrap();
    controller
        .delete_account_metadata(&alice, "tier", None)
        .await
        .unwrap();

    let exported = controller.export_logs().await.unwrap();
    verify_chain(&exported, 0, None).unwrap();

    registry
        .create_ledger("l2", LedgerConfig::default())
        .await
        .unwrap();
    let copy = registry.controller("l2").await.unwrap();
    copy.import_logs(exported.clone()).await.unwrap();
    let copy_queries = copy.queries();

    // identical balances, accounts, transactions and chain
    for address in ["world", "alice", "bob"] {
        assert_eq!(
            balance(&queries, address).await,
            balance(&copy_queries, address).await,
            "{}",
            address
        );
    }
    assert_eq!(
        queries
            .count_transactions(TransactionsQueryOptions::default())
            .await
            .unwrap(),
        copy_queries
            .count_transactions(TransactionsQueryOptions::default())
            .await
            .unwrap(),
    );
    let reexported = copy.export_logs().await.unwrap();
    assert_eq!(reexported.len(), exported.len());
    for (a, b) in exported.iter().zip(&reexported) {
        assert_eq!(a.hash, b.hash);
    }

    let original = copy_queries.get_transaction(1, None).await.unwrap();
    assert!(original.reverted_at.is_some());
}

#[tokio::test]
async fn import_rejects_broken_chain() {
    let (registry, controller, _queries) = setup().await;
    controller
        .create_transaction(input(vec![posting("world", "alice", 100)]), None)
        .await
        .unwrap();
    let mut exported = controller.export_logs().await.unwrap();
    exported[0].hash = Some("00".repeat(32));

    registry
        .create_ledger("l2", LedgerConfig::default())
        .await
        .unwrap();
    let copy = registry.controller("l2").await.unwrap();
    let err = copy.import_logs(exported).await.unwrap_err();
    assert_eq!(err.code(), "IMPORT_HASH_MISMATCH");
}

// ── Script path ───────────────────────────────────────────────────────────

struct StubEvaluator {
    result: ScriptResult,
}

#[async_trait]
impl ScriptEvaluator for StubEvaluator {
    async fn evaluate(
        &self,
        _plain: &str,
        _vars: &BTreeMap<String, Value>,
        _reader: &dyn BalanceReader,
    ) -> Result<ScriptResult, LedgerError> {
        Ok(self.result.clone())
    }
}

fn script_input(metadata: Metadata) -> TransactionInput {
    TransactionInput::Script {
        script: RunScript {
            plain: "send [USD 100] (source = @world destination = @alice)".to_string(),
            vars: BTreeMap::new(),
        },
        timestamp: None,
        reference: None,
        metadata,
    }
}

#[tokio::test]
async fn script_postings_and_metadata_are_applied() {
    let evaluator = Arc::new(StubEvaluator {
        result: ScriptResult {
            postings: vec![posting("world", "alice", 100)],
            transaction_metadata: Metadata::from([("kind".to_string(), json!("payout"))]),
            account_metadata: BTreeMap::from([(
                "alice".to_string(),
                Metadata::from([("tier".to_string(), json!("gold"))]),
            )]),
        },
    });
    let (_registry, controller, queries) =
        setup_with(LedgerConfig::default(), evaluator).await;

    let outcome = controller
        .create_transaction(script_input(Metadata::new()), None)
        .await
        .unwrap();
    assert_eq!(outcome.transaction.metadata.get("kind"), Some(&json!("payout")));
    assert_eq!(balance(&queries, "alice").await, Amount::from(100));

    let account = queries
        .get_account(AccountAddress::new("alice").unwrap(), None, false, false)
        .await
        .unwrap();
    assert_eq!(account.metadata.get("tier"), Some(&json!("gold")));
}

#[tokio::test]
async fn script_metadata_override_is_rejected() {
    let evaluator = Arc::new(StubEvaluator {
        result: ScriptResult {
            postings: vec![posting("world", "alice", 100)],
            transaction_metadata: Metadata::from([("kind".to_string(), json!("payout"))]),
            account_metadata: BTreeMap::new(),
        },
    });
    let (_registry, controller, _queries) =
        setup_with(LedgerConfig::default(), evaluator).await;

    let err = controller
        .create_transaction(
            script_input(Metadata::from([("kind".to_string(), json!("refund"))])),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "METADATA_OVERRIDE");
}

#[tokio::test]
async fn script_errors_keep_their_classification() {
    let (_registry, controller, _queries) = setup().await;
    let err = controller
        .create_transaction(script_input(Metadata::new()), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "COMPILATION_FAILED");
    assert!(matches!(
        err,
        LedgerError::Script {
            kind: ScriptErrorKind::Compilation,
            ..
        }
    ));
}

// ── Large amounts ─────────────────────────────────────────────────────────

#[tokio::test]
async fn amounts_beyond_machine_integers_stay_exact() {
    let (_registry, controller, queries) = setup().await;
    let huge = Amount::from_str("340282366920938463463374607431768211456").unwrap();
    controller
        .create_transaction(input(vec![Posting::new(
            AccountAddress::new("world").unwrap(),
            AccountAddress::new("alice").unwrap(),
            huge.clone(),
            "USD",
        )]),
        None)
        .await
        .unwrap();
    assert_eq!(balance(&queries, "alice").await, huge);
}
