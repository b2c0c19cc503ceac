// src/query/mod.rs
//
// Read-only pipeline: feature gating, filter validation, pagination.
pub mod cursor;
pub mod filter;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::adapters::{
    AccountsQueryOptions, AggregatedBalancesQuery, GetAccountQuery, LedgerStore, LogsQueryOptions,
    TransactionsQueryOptions, VolumesQueryOptions, VolumesWithBalance,
};
use crate::core::{Account, AccountAddress, Log, Transaction, VolumesByAsset};
use crate::error::LedgerError;
use crate::query::cursor::{Cursor, Page};
use crate::query::filter::{
    uses_balance, uses_metadata, validate_accounts_filter, validate_transactions_filter,
};
use crate::registry::features::Feature;
use crate::registry::ledger::Ledger;

/// Query pipeline for one ledger.
#[derive(Clone)]
pub struct QueryController {
    ledger: Ledger,
    store: Arc<dyn LedgerStore>,
}

impl QueryController {
    pub fn new(ledger: Ledger, store: Arc<dyn LedgerStore>) -> Self {
        Self { ledger, store }
    }

    fn require(&self, feature: Feature) -> Result<(), LedgerError> {
        if self.ledger.features.is_enabled(feature) {
            Ok(())
        } else {
            Err(LedgerError::MissingFeature(feature.name().to_string()))
        }
    }

    fn check_accounts_options(&self, options: &AccountsQueryOptions) -> Result<(), LedgerError> {
        if let Some(filter) = &options.filter {
            validate_accounts_filter(filter)?;
            if uses_balance(filter) {
                self.require(Feature::MovesHistory)?;
            }
            if options.pit.is_some() && uses_metadata(filter) {
                self.require(Feature::AccountMetadataHistory)?;
            }
        }
        if options.expand_volumes {
            self.require(Feature::MovesHistory)?;
        }
        if options.expand_effective_volumes {
            self.require(Feature::MovesHistoryPostCommitEffectiveVolumes)?;
        }
        Ok(())
    }

    fn check_transactions_options(
        &self,
        options: &TransactionsQueryOptions,
    ) -> Result<(), LedgerError> {
        if let Some(filter) = &options.filter {
            validate_transactions_filter(filter)?;
            if options.pit.is_some() && uses_metadata(filter) {
                self.require(Feature::TransactionMetadataHistory)?;
            }
        }
        Ok(())
    }

    pub async fn list_accounts(
        &self,
        options: AccountsQueryOptions,
        page_size: Option<u64>,
        cursor: Option<&str>,
    ) -> Result<Cursor<Account>, LedgerError> {
        self.check_accounts_options(&options)?;
        let page = Page::resolve(cursor, page_size)?;
        let (data, has_more) = self.store.list_accounts(options, page.clone()).await?;
        Ok(Cursor::build(&page, data, has_more))
    }

    pub async fn get_account(
        &self,
        address: AccountAddress,
        pit: Option<DateTime<Utc>>,
        expand_volumes: bool,
        expand_effective_volumes: bool,
    ) -> Result<Account, LedgerError> {
        if expand_volumes {
            self.require(Feature::MovesHistory)?;
        }
        if expand_effective_volumes {
            self.require(Feature::MovesHistoryPostCommitEffectiveVolumes)?;
        }
        if pit.is_some() {
            self.require(Feature::AccountMetadataHistory)?;
        }
        self.store
            .get_account(GetAccountQuery {
                address,
                pit,
                expand_volumes,
                expand_effective_volumes,
            })
            .await?
            .ok_or(LedgerError::NotFound)
    }

    pub async fn count_accounts(&self, options: AccountsQueryOptions) -> Result<u64, LedgerError> {
        self.check_accounts_options(&options)?;
        self.store.count_accounts(options).await
    }

    pub async fn list_transactions(
        &self,
        options: TransactionsQueryOptions,
        page_size: Option<u64>,
        cursor: Option<&str>,
    ) -> Result<Cursor<Transaction>, LedgerError> {
        self.check_transactions_options(&options)?;
        let page = Page::resolve(cursor, page_size)?;
        let (data, has_more) = self.store.list_transactions(options, page.clone()).await?;
        Ok(Cursor::build(&page, data, has_more))
    }

    pub async fn get_transaction(
        &self,
        id: u64,
        pit: Option<DateTime<Utc>>,
    ) -> Result<Transaction, LedgerError> {
        if pit.is_some() {
            self.require(Feature::TransactionMetadataHistory)?;
        }
        self.store
            .get_transaction(id, pit)
            .await?
            .ok_or(LedgerError::NotFound)
    }

    pub async fn count_transactions(
        &self,
        options: TransactionsQueryOptions,
    ) -> Result<u64, LedgerError> {
        self.check_transactions_options(&options)?;
        self.store.count_transactions(options).await
    }

    /// Per-asset balances summed over the filtered account set.
    pub async fn get_aggregated_balances(
        &self,
        query: AggregatedBalancesQuery,
    ) -> Result<VolumesByAsset, LedgerError> {
        if let Some(filter) = &query.filter {
            validate_accounts_filter(filter)?;
        }
        self.require(Feature::MovesHistory)?;
        if query.pit.is_some() && !query.use_insertion_date {
            self.require(Feature::MovesHistoryPostCommitEffectiveVolumes)?;
        }
        self.store.aggregated_balances(query).await
    }

    pub async fn get_volumes_with_balances(
        &self,
        options: VolumesQueryOptions,
        page_size: Option<u64>,
        cursor: Option<&str>,
    ) -> Result<Cursor<VolumesWithBalance>, LedgerError> {
        if let Some(filter) = &options.filter {
            validate_accounts_filter(filter)?;
        }
        self.require(Feature::MovesHistory)?;
        if options.pit.is_some() && !options.use_insertion_date {
            self.require(Feature::MovesHistoryPostCommitEffectiveVolumes)?;
        }
        let page = Page::resolve(cursor, page_size)?;
        let (data, has_more) = self
            .store
            .volumes_with_balances(options, page.clone())
            .await?;
        Ok(Cursor::build(&page, data, has_more))
    }

    pub async fn list_logs(
        &self,
        options: LogsQueryOptions,
        page_size: Option<u64>,
        cursor: Option<&str>,
    ) -> Result<Cursor<Log>, LedgerError> {
        let page = Page::resolve(cursor, page_size)?;
        let (data, has_more) = self.store.list_logs(options, page.clone()).await?;
        Ok(Cursor::build(&page, data, has_more))
    }
}

impl crate::engine::LedgerController {
    /// The read-only counterpart bound to the same ledger and store.
    pub fn queries(&self) -> QueryController {
        QueryController::new(self.ledger().clone(), self.store().clone())
    }
}
