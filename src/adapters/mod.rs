// src/adapters/mod.rs
//
// The storage capability: one async trait, two implementations (memory for
// tests and embedding, postgres for production). The commit controller
// builds a CommitPlan and the store applies it in a single atomic step.
pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{Account, AccountAddress, Amount, Log, Metadata, Transaction, VolumesByAsset};
use crate::engine::plan::{CommitPlan, IdempotencyInfo};
use crate::error::LedgerError;
use crate::query::cursor::Page;
use crate::query::filter::Filter;
use crate::registry::ledger::Ledger;

#[derive(Debug, Clone)]
pub struct GetAccountQuery {
    pub address: AccountAddress,
    pub pit: Option<DateTime<Utc>>,
    pub expand_volumes: bool,
    pub expand_effective_volumes: bool,
}

impl GetAccountQuery {
    pub fn new(address: AccountAddress) -> Self {
        Self {
            address,
            pit: None,
            expand_volumes: false,
            expand_effective_volumes: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccountsQueryOptions {
    pub pit: Option<DateTime<Utc>>,
    pub expand_volumes: bool,
    pub expand_effective_volumes: bool,
    pub filter: Option<Filter>,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionsQueryOptions {
    /// Inclusive upper bound on the effective timestamp.
    pub pit: Option<DateTime<Utc>>,
    pub filter: Option<Filter>,
}

#[derive(Debug, Clone, Default)]
pub struct AggregatedBalancesQuery {
    pub pit: Option<DateTime<Utc>>,
    /// Bound the aggregation on insertion dates instead of effective dates.
    pub use_insertion_date: bool,
    pub filter: Option<Filter>,
}

#[derive(Debug, Clone, Default)]
pub struct VolumesQueryOptions {
    pub pit: Option<DateTime<Utc>>,
    pub use_insertion_date: bool,
    /// Group accounts by their first N address segments.
    pub group_by: Option<usize>,
    pub filter: Option<Filter>,
}

#[derive(Debug, Clone, Default)]
pub struct LogsQueryOptions {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub after_id: Option<u64>,
}

/// One row of the volumes endpoint: per-account (or group) per-asset volumes
/// with the derived balance.
#[derive(Debug, Clone, Serialize)]
pub struct VolumesWithBalance {
    pub account: String,
    pub asset: String,
    pub input: Amount,
    pub output: Amount,
    pub balance: Amount,
}

/// Result of one applied commit.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub transaction: Transaction,
    pub log: Log,
}

/// Balance reads, as exposed to the script evaluator.
#[async_trait]
pub trait BalanceReader: Send + Sync {
    async fn get_balance(
        &self,
        address: &AccountAddress,
        asset: &str,
    ) -> Result<Amount, LedgerError>;
}

/// Storage engine bound to one ledger.
///
/// Mutations are atomic: each call either applies everything it names (rows,
/// moves, metadata revisions, the log entry) or nothing. Retryable write
/// conflicts surface as `LedgerError::Deadlock`.
#[async_trait]
pub trait LedgerStore: BalanceReader {
    fn ledger(&self) -> &Ledger;

    /// False when the bucket schema is behind what this build expects;
    /// mutating pipelines must then fail OUTDATED_SCHEMA.
    async fn is_up_to_date(&self) -> Result<bool, LedgerError>;

    async fn commit(&self, plan: CommitPlan) -> Result<CommitOutcome, LedgerError>;

    async fn save_account_metadata(
        &self,
        address: &AccountAddress,
        metadata: Metadata,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError>;

    async fn delete_account_metadata(
        &self,
        address: &AccountAddress,
        key: &str,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError>;

    async fn save_transaction_metadata(
        &self,
        id: u64,
        metadata: Metadata,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError>;

    async fn delete_transaction_metadata(
        &self,
        id: u64,
        key: &str,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError>;

    async fn get_account(&self, query: GetAccountQuery) -> Result<Option<Account>, LedgerError>;

    async fn list_accounts(
        &self,
        options: AccountsQueryOptions,
        page: Page,
    ) -> Result<(Vec<Account>, bool), LedgerError>;

    async fn count_accounts(&self, options: AccountsQueryOptions) -> Result<u64, LedgerError>;

    async fn get_transaction(
        &self,
        id: u64,
        pit: Option<DateTime<Utc>>,
    ) -> Result<Option<Transaction>, LedgerError>;

    async fn list_transactions(
        &self,
        options: TransactionsQueryOptions,
        page: Page,
    ) -> Result<(Vec<Transaction>, bool), LedgerError>;

    async fn count_transactions(
        &self,
        options: TransactionsQueryOptions,
    ) -> Result<u64, LedgerError>;

    async fn aggregated_balances(
        &self,
        query: AggregatedBalancesQuery,
    ) -> Result<VolumesByAsset, LedgerError>;

    async fn volumes_with_balances(
        &self,
        options: VolumesQueryOptions,
        page: Page,
    ) -> Result<(Vec<VolumesWithBalance>, bool), LedgerError>;

    /// Most recent first.
    async fn list_logs(
        &self,
        options: LogsQueryOptions,
        page: Page,
    ) -> Result<(Vec<Log>, bool), LedgerError>;

    async fn last_log(&self) -> Result<Option<Log>, LedgerError>;

    async fn log_by_idempotency_key(&self, key: &str) -> Result<Option<Log>, LedgerError>;

    /// Effective timestamp of the last committed transaction.
    async fn last_committed_timestamp(&self) -> Result<Option<DateTime<Utc>>, LedgerError>;

    /// Full log stream in id order, for export.
    async fn read_logs(&self) -> Result<Vec<Log>, LedgerError>;

    /// Replay a verified log stream into this (empty) ledger.
    async fn import_logs(&self, logs: Vec<Log>) -> Result<(), LedgerError>;
}

/// Opens catalog state and per-ledger stores for one backend.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Persist a catalog row in state INITIALIZING.
    async fn insert_ledger(&self, ledger: &Ledger) -> Result<(), LedgerError>;

    async fn get_ledger(&self, name: &str) -> Result<Option<Ledger>, LedgerError>;

    async fn list_ledgers(&self) -> Result<Vec<Ledger>, LedgerError>;

    async fn update_ledger_state(
        &self,
        name: &str,
        state: crate::registry::ledger::State,
    ) -> Result<(), LedgerError>;

    async fn update_ledger_metadata(
        &self,
        name: &str,
        metadata: Metadata,
    ) -> Result<(), LedgerError>;

    async fn delete_ledger_metadata(&self, name: &str, key: &str) -> Result<(), LedgerError>;

    /// Bring the bucket schema up to this build's version. Fails
    /// BUCKET_OUTDATED when the bucket was created by a newer build.
    async fn migrate_bucket(&self, bucket: &str) -> Result<(), LedgerError>;

    async fn open_store(&self, ledger: Ledger) -> Result<Arc<dyn LedgerStore>, LedgerError>;
}

/// Shared shape for metadata history rows.
#[derive(Debug, Clone)]
pub struct MetadataRevision {
    pub revision: u64,
    pub date: DateTime<Utc>,
    pub metadata: Metadata,
}

/// Latest metadata revision at or before `pit`; empty when nothing existed yet.
pub fn metadata_at(revisions: &[MetadataRevision], pit: DateTime<Utc>) -> Metadata {
    revisions
        .iter()
        .rev()
        .find(|r| r.date <= pit)
        .map(|r| r.metadata.clone())
        .unwrap_or_default()
}

/// Group an address to its first `depth` segments.
pub fn group_address(address: &str, depth: usize) -> String {
    let mut segments: Vec<&str> = address.split('/').collect();
    segments.truncate(depth.max(1));
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_address_depths() {
        assert_eq!(group_address("users/1234/wallet", 1), "users");
        assert_eq!(group_address("users/1234/wallet", 2), "users/1234");
        assert_eq!(group_address("users/1234/wallet", 5), "users/1234/wallet");
        assert_eq!(group_address("world", 0), "world");
    }

    #[test]
    fn metadata_at_picks_latest_revision() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::hours(1);
        let revisions = vec![
            MetadataRevision {
                revision: 0,
                date: t0,
                metadata: Metadata::from([("a".to_string(), serde_json::json!(1))]),
            },
            MetadataRevision {
                revision: 1,
                date: t1,
                metadata: Metadata::from([("a".to_string(), serde_json::json!(2))]),
            },
        ];
        assert_eq!(metadata_at(&revisions, t0), revisions[0].metadata);
        assert_eq!(metadata_at(&revisions, t1), revisions[1].metadata);
        assert!(metadata_at(&revisions, t0 - chrono::Duration::hours(1)).is_empty());
    }
}
