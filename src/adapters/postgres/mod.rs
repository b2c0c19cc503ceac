// src/adapters/postgres/mod.rs
//
// Production storage engine. One Postgres schema per bucket; per-ledger
// commits are serialized by a head row lock, so transaction ids and log ids
// stay dense and the hash chain never forks.
mod accounts;
mod filter;
mod logs;
mod moves;
pub mod schema;
mod transactions;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::adapters::{
    AccountsQueryOptions, AggregatedBalancesQuery, BalanceReader, CommitOutcome, Driver,
    GetAccountQuery, LedgerStore, LogsQueryOptions, TransactionsQueryOptions,
    VolumesQueryOptions, VolumesWithBalance,
};
use crate::core::{Account, AccountAddress, Amount, Log, Metadata, Transaction, VolumesByAsset};
use crate::engine::plan::{CommitPlan, IdempotencyInfo};
use crate::error::LedgerError;
use crate::query::cursor::Page;
use crate::registry::ledger::{Ledger, State};

/// Map driver faults to the domain. Deadlocks and serialization failures
/// become the retryable kind consumed by the commit loop.
pub(crate) fn map_sqlx_err(err: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some("40P01") | Some("40001") => return LedgerError::Deadlock,
            Some("23505") => {
                return match db.constraint() {
                    Some("transactions_reference_unique") => {
                        LedgerError::ReferenceConflict(db.message().to_string())
                    }
                    Some("logs_idempotency_key_unique") => {
                        LedgerError::IdempotencyKeyConflict(db.message().to_string())
                    }
                    _ => LedgerError::Storage(db.message().to_string()),
                }
            }
            _ => {}
        }
    }
    LedgerError::Storage(err.to_string())
}

pub struct PostgresDriver {
    pool: PgPool,
}

impl PostgresDriver {
    /// Connect using `POSTGRES_URI`-style connection strings.
    pub async fn connect(uri: &str) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(uri)
            .await
            .map_err(map_sqlx_err)?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> Result<Self, LedgerError> {
        schema::ensure_system_schema(&pool).await?;
        Ok(Self { pool })
    }

    fn system_table(&self, name: &str) -> String {
        format!("\"{}\".{}", schema::SYSTEM_SCHEMA, name)
    }
}

fn decode_ledger_row(row: &sqlx::postgres::PgRow) -> Result<Ledger, LedgerError> {
    let features: serde_json::Value = row.try_get("features").map_err(map_sqlx_err)?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(map_sqlx_err)?;
    let state: String = row.try_get("state").map_err(map_sqlx_err)?;
    Ok(Ledger {
        name: row.try_get("name").map_err(map_sqlx_err)?,
        bucket: row.try_get("bucket").map_err(map_sqlx_err)?,
        features: serde_json::from_value(features)
            .map_err(|err| LedgerError::Storage(err.to_string()))?,
        metadata: serde_json::from_value(metadata)
            .map_err(|err| LedgerError::Storage(err.to_string()))?,
        state: serde_json::from_value(serde_json::Value::String(state))
            .map_err(|err| LedgerError::Storage(err.to_string()))?,
        added_at: row.try_get("added_at").map_err(map_sqlx_err)?,
    })
}

#[async_trait]
impl Driver for PostgresDriver {
    async fn insert_ledger(&self, ledger: &Ledger) -> Result<(), LedgerError> {
        let state = serde_json::to_value(ledger.state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "INITIALIZING".to_string());
        let inserted = sqlx::query(&format!(
            "INSERT INTO {} (name, bucket, features, metadata, state, added_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (name) DO NOTHING",
            self.system_table("ledgers"),
        ))
        .bind(&ledger.name)
        .bind(&ledger.bucket)
        .bind(serde_json::to_value(&ledger.features).unwrap_or_default())
        .bind(serde_json::to_value(&ledger.metadata).unwrap_or_default())
        .bind(state)
        .bind(ledger.added_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if inserted.rows_affected() == 0 {
            return Err(LedgerError::LedgerAlreadyExists(ledger.name.clone()));
        }
        Ok(())
    }

    async fn get_ledger(&self, name: &str) -> Result<Option<Ledger>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT name, bucket, features, metadata, state, added_at FROM {} WHERE name = $1",
            self.system_table("ledgers"),
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.as_ref().map(decode_ledger_row).transpose()
    }

    async fn list_ledgers(&self) -> Result<Vec<Ledger>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT name, bucket, features, metadata, state, added_at FROM {} ORDER BY name",
            self.system_table("ledgers"),
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.iter().map(decode_ledger_row).collect()
    }

    async fn update_ledger_state(&self, name: &str, state: State) -> Result<(), LedgerError> {
        let state = serde_json::to_value(state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let updated = sqlx::query(&format!(
            "UPDATE {} SET state = $2 WHERE name = $1",
            self.system_table("ledgers"),
        ))
        .bind(name)
        .bind(state)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        if updated.rows_affected() == 0 {
            return Err(LedgerError::NotFound);
        }
        Ok(())
    }

    async fn update_ledger_metadata(
        &self,
        name: &str,
        metadata: Metadata,
    ) -> Result<(), LedgerError> {
        let updated = sqlx::query(&format!(
            "UPDATE {} SET metadata = metadata || $2 WHERE name = $1",
            self.system_table("ledgers"),
        ))
        .bind(name)
        .bind(serde_json::to_value(&metadata).unwrap_or_default())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        if updated.rows_affected() == 0 {
            return Err(LedgerError::NotFound);
        }
        Ok(())
    }

    async fn delete_ledger_metadata(&self, name: &str, key: &str) -> Result<(), LedgerError> {
        let updated = sqlx::query(&format!(
            "UPDATE {} SET metadata = metadata - $2 WHERE name = $1",
            self.system_table("ledgers"),
        ))
        .bind(name)
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        if updated.rows_affected() == 0 {
            return Err(LedgerError::NotFound);
        }
        Ok(())
    }

    async fn migrate_bucket(&self, bucket: &str) -> Result<(), LedgerError> {
        schema::migrate_bucket(&self.pool, bucket).await
    }

    async fn open_store(&self, ledger: Ledger) -> Result<Arc<dyn LedgerStore>, LedgerError> {
        Ok(Arc::new(PostgresLedgerStore::new(ledger, self.pool.clone())))
    }
}

/// Per-ledger store bound to its bucket schema.
pub struct PostgresLedgerStore {
    ledger: Ledger,
    pool: PgPool,
    schema: String,
}

impl PostgresLedgerStore {
    pub fn new(ledger: Ledger, pool: PgPool) -> Self {
        let schema = format!("\"{}\"", ledger.bucket);
        Self {
            ledger,
            pool,
            schema,
        }
    }

    pub(crate) fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    pub(crate) fn feature(&self, feature: crate::registry::features::Feature) -> bool {
        self.ledger.features.is_enabled(feature)
    }
}

#[async_trait]
impl BalanceReader for PostgresLedgerStore {
    async fn get_balance(
        &self,
        address: &AccountAddress,
        asset: &str,
    ) -> Result<Amount, LedgerError> {
        self.current_balance(address.as_str(), asset).await
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    async fn is_up_to_date(&self) -> Result<bool, LedgerError> {
        let version = schema::bucket_version(&self.pool, &self.ledger.bucket).await?;
        Ok(version == schema::supported_bucket_version())
    }

    async fn commit(&self, plan: CommitPlan) -> Result<CommitOutcome, LedgerError> {
        self.commit_impl(plan).await
    }

    async fn save_account_metadata(
        &self,
        address: &AccountAddress,
        metadata: Metadata,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError> {
        self.save_account_metadata_impl(address, metadata, idempotency)
            .await
    }

    async fn delete_account_metadata(
        &self,
        address: &AccountAddress,
        key: &str,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError> {
        self.delete_account_metadata_impl(address, key, idempotency)
            .await
    }

    async fn save_transaction_metadata(
        &self,
        id: u64,
        metadata: Metadata,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError> {
        self.save_transaction_metadata_impl(id, metadata, idempotency)
            .await
    }

    async fn delete_transaction_metadata(
        &self,
        id: u64,
        key: &str,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError> {
        self.delete_transaction_metadata_impl(id, key, idempotency)
            .await
    }

    async fn get_account(&self, query: GetAccountQuery) -> Result<Option<Account>, LedgerError> {
        self.get_account_impl(query).await
    }

    async fn list_accounts(
        &self,
        options: AccountsQueryOptions,
        page: Page,
    ) -> Result<(Vec<Account>, bool), LedgerError> {
        self.list_accounts_impl(options, page).await
    }

    async fn count_accounts(&self, options: AccountsQueryOptions) -> Result<u64, LedgerError> {
        self.count_accounts_impl(options).await
    }

    async fn get_transaction(
        &self,
        id: u64,
        pit: Option<DateTime<Utc>>,
    ) -> Result<Option<Transaction>, LedgerError> {
        self.get_transaction_impl(id, pit).await
    }

    async fn list_transactions(
        &self,
        options: TransactionsQueryOptions,
        page: Page,
    ) -> Result<(Vec<Transaction>, bool), LedgerError> {
        self.list_transactions_impl(options, page).await
    }

    async fn count_transactions(
        &self,
        options: TransactionsQueryOptions,
    ) -> Result<u64, LedgerError> {
        self.count_transactions_impl(options).await
    }

    async fn aggregated_balances(
        &self,
        query: AggregatedBalancesQuery,
    ) -> Result<VolumesByAsset, LedgerError> {
        self.aggregated_balances_impl(query).await
    }

    async fn volumes_with_balances(
        &self,
        options: VolumesQueryOptions,
        page: Page,
    ) -> Result<(Vec<VolumesWithBalance>, bool), LedgerError> {
        self.volumes_with_balances_impl(options, page).await
    }

    async fn list_logs(
        &self,
        options: LogsQueryOptions,
        page: Page,
    ) -> Result<(Vec<Log>, bool), LedgerError> {
        self.list_logs_impl(options, page).await
    }

    async fn last_log(&self) -> Result<Option<Log>, LedgerError> {
        self.last_log_impl().await
    }

    async fn log_by_idempotency_key(&self, key: &str) -> Result<Option<Log>, LedgerError> {
        self.log_by_idempotency_key_impl(key).await
    }

    async fn last_committed_timestamp(&self) -> Result<Option<DateTime<Utc>>, LedgerError> {
        self.last_committed_timestamp_impl().await
    }

    async fn read_logs(&self) -> Result<Vec<Log>, LedgerError> {
        self.read_logs_impl().await
    }

    async fn import_logs(&self, logs: Vec<Log>) -> Result<(), LedgerError> {
        self.import_logs_impl(logs).await
    }
}
