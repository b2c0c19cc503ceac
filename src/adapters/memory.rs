// src/adapters/memory.rs
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::adapters::{
    group_address, metadata_at, AccountsQueryOptions, AggregatedBalancesQuery, BalanceReader,
    CommitOutcome, Driver, GetAccountQuery, LedgerStore, LogsQueryOptions, MetadataRevision,
    TransactionsQueryOptions, VolumesQueryOptions, VolumesWithBalance,
};
use crate::core::{
    aggregate_volumes, metadata, verify_chain, Account, AccountAddress, Amount, Log, LogData,
    Metadata, MetadataTarget, Transaction, Volumes, VolumesByAsset,
};
use crate::engine::plan::{check_balances, CommitPlan, IdempotencyInfo};
use crate::error::LedgerError;
use crate::query::cursor::Page;
use crate::query::filter::{compare_amount, match_address, parse_key, Filter, FilterKey, Operator};
use crate::registry::features::Feature;
use crate::registry::ledger::{Ledger, State};

/// One balance delta on one account, with both running snapshots.
#[derive(Debug, Clone)]
struct Move {
    seq: u64,
    transaction_id: u64,
    account: String,
    asset: String,
    amount: Amount,
    is_source: bool,
    insertion_date: DateTime<Utc>,
    effective_date: DateTime<Utc>,
    post_commit_volumes: Option<Volumes>,
    post_commit_effective_volumes: Option<Volumes>,
}

#[derive(Default)]
struct LedgerState {
    accounts: BTreeMap<String, Account>,
    account_metadata_history: BTreeMap<String, Vec<MetadataRevision>>,
    transactions: Vec<Transaction>,
    transaction_metadata_history: BTreeMap<u64, Vec<MetadataRevision>>,
    moves: Vec<Move>,
    logs: Vec<Log>,
}

/// In-memory ledger store.
///
/// The mutex is held for the entire duration of every mutation — this is the
/// memory equivalent of BEGIN/SELECT FOR UPDATE/COMMIT: no other task can
/// observe a half-applied commit, and no deadlock is possible.
pub struct MemoryLedgerStore {
    ledger: Ledger,
    state: Mutex<LedgerState>,
}

impl MemoryLedgerStore {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            state: Mutex::new(LedgerState::default()),
        }
    }

    fn feature(&self, feature: Feature) -> bool {
        self.ledger.features.is_enabled(feature)
    }
}

// ── Volume trails ─────────────────────────────────────────────────────────

/// Latest insertion-order snapshot among moves passing the date bound.
/// `by_insertion_date` switches the bound between the two date columns; the
/// trail itself is always ordered by seq.
fn pcv_at(
    state: &LedgerState,
    account: &str,
    asset: &str,
    pit: Option<DateTime<Utc>>,
    by_insertion_date: bool,
) -> Volumes {
    let candidate = state
        .moves
        .iter()
        .filter(|m| m.account == account && m.asset == asset)
        .filter(|m| match pit {
            Some(date) => {
                if by_insertion_date {
                    m.insertion_date <= date
                } else {
                    m.effective_date <= date
                }
            }
            None => true,
        })
        .max_by_key(|m| m.seq);

    match candidate {
        Some(found) => found.post_commit_volumes.clone().unwrap_or_else(|| {
            // snapshots not maintained: fold the trail up to the candidate
            fold_moves(state, account, asset, |m| m.seq <= found.seq)
        }),
        None => Volumes::zero(),
    }
}

/// Latest effective-order snapshot among moves with effective_date <= pit.
fn pcev_at(state: &LedgerState, account: &str, asset: &str, pit: Option<DateTime<Utc>>) -> Volumes {
    let candidate = state
        .moves
        .iter()
        .filter(|m| m.account == account && m.asset == asset)
        .filter(|m| match pit {
            Some(date) => m.effective_date <= date,
            None => true,
        })
        .max_by_key(|m| (m.effective_date, m.seq));

    match candidate {
        Some(found) => found
            .post_commit_effective_volumes
            .clone()
            .unwrap_or_else(|| {
                fold_moves(state, account, asset, |m| {
                    (m.effective_date, m.seq) <= (found.effective_date, found.seq)
                })
            }),
        None => Volumes::zero(),
    }
}

fn fold_moves(
    state: &LedgerState,
    account: &str,
    asset: &str,
    include: impl Fn(&Move) -> bool,
) -> Volumes {
    state
        .moves
        .iter()
        .filter(|m| m.account == account && m.asset == asset && include(m))
        .fold(Volumes::zero(), |acc, m| acc.apply(&m.amount, m.is_source))
}

fn assets_of(state: &LedgerState, account: &str) -> BTreeSet<String> {
    state
        .moves
        .iter()
        .filter(|m| m.account == account)
        .map(|m| m.asset.clone())
        .collect()
}

fn current_balance(state: &LedgerState, account: &str, asset: &str) -> Amount {
    fold_moves(state, account, asset, |_| true).balance()
}

// ── Write path internals ──────────────────────────────────────────────────

struct UpsertOutcome {
    metadata_changed: bool,
}

fn upsert_account(
    state: &mut LedgerState,
    address: &str,
    first_usage: DateTime<Utc>,
    incoming_metadata: Option<&Metadata>,
    now: DateTime<Utc>,
) -> UpsertOutcome {
    let is_new = !state.accounts.contains_key(address);
    let account = state.accounts.entry(address.to_string()).or_insert_with(|| {
        let parsed = AccountAddress::new(address).expect("addresses are validated upstream");
        let mut fresh = Account::new(parsed, now);
        fresh.first_usage = first_usage;
        fresh
    });

    let mut changed = is_new;
    if first_usage < account.first_usage {
        account.first_usage = first_usage;
        changed = true;
    }
    let mut metadata_changed = false;
    if let Some(incoming) = incoming_metadata {
        metadata_changed = metadata::merge(&mut account.metadata, incoming);
        changed |= metadata_changed;
    }
    if changed {
        account.updated_at = now;
    }

    UpsertOutcome { metadata_changed }
}

fn record_account_metadata_revision(state: &mut LedgerState, address: &str, now: DateTime<Utc>) {
    let metadata = state
        .accounts
        .get(address)
        .map(|a| a.metadata.clone())
        .unwrap_or_default();
    let history = state
        .account_metadata_history
        .entry(address.to_string())
        .or_default();
    history.push(MetadataRevision {
        revision: history.len() as u64,
        date: now,
        metadata,
    });
}

fn record_transaction_metadata_revision(state: &mut LedgerState, id: u64, now: DateTime<Utc>) {
    let metadata = state
        .transactions
        .get(id as usize)
        .map(|t| t.metadata.clone())
        .unwrap_or_default();
    let history = state.transaction_metadata_history.entry(id).or_default();
    history.push(MetadataRevision {
        revision: history.len() as u64,
        date: now,
        metadata,
    });
}

fn insert_move(
    state: &mut LedgerState,
    maintain_pcv: bool,
    maintain_pcev: bool,
    transaction_id: u64,
    account: &str,
    asset: &str,
    amount: &Amount,
    is_source: bool,
    insertion_date: DateTime<Utc>,
    effective_date: DateTime<Utc>,
) {
    let seq = state.moves.len() as u64;

    let post_commit_volumes = maintain_pcv.then(|| {
        pcv_at(state, account, asset, None, false).apply(amount, is_source)
    });

    state.moves.push(Move {
        seq,
        transaction_id,
        account: account.to_string(),
        asset: asset.to_string(),
        amount: amount.clone(),
        is_source,
        insertion_date,
        effective_date,
        post_commit_volumes,
        post_commit_effective_volumes: None,
    });

    if maintain_pcev {
        // Rebuild the effective-order trail for this (account, asset). A
        // back-dated move invalidates every snapshot after it, so walk the
        // whole trail in (effective_date, seq) order.
        let mut indexes: Vec<usize> = state
            .moves
            .iter()
            .enumerate()
            .filter(|(_, m)| m.account == account && m.asset == asset)
            .map(|(i, _)| i)
            .collect();
        indexes.sort_by_key(|&i| (state.moves[i].effective_date, state.moves[i].seq));

        let mut running = Volumes::zero();
        for i in indexes {
            running = running.apply(&state.moves[i].amount, state.moves[i].is_source);
            state.moves[i].post_commit_effective_volumes = Some(running.clone());
        }
    }
}

/// Insert the transaction's account rows, moves and metadata revisions.
/// Shared by the commit path and log replay; `now` is the transaction's
/// insertion date so replay rebuilds identical state.
fn apply_transaction(
    state: &mut LedgerState,
    features: &crate::registry::features::FeatureSet,
    transaction: &Transaction,
    account_metadata: &BTreeMap<String, Metadata>,
) {
    let now = transaction.inserted_at;
    let maintain_pcv = features.is_enabled(Feature::MovesHistory);
    let maintain_pcev = features.is_enabled(Feature::MovesHistoryPostCommitEffectiveVolumes);
    let account_history = features.is_enabled(Feature::AccountMetadataHistory);

    let involved: BTreeSet<String> = transaction
        .involved_accounts()
        .into_iter()
        .map(|a| a.as_str().to_string())
        .collect();
    for address in &involved {
        let outcome = upsert_account(
            state,
            address,
            transaction.timestamp,
            account_metadata.get(address),
            now,
        );
        if account_history && outcome.metadata_changed {
            record_account_metadata_revision(state, address, now);
        }
    }
    // metadata targets that no posting touches still get account rows
    for (address, incoming) in account_metadata {
        if involved.contains(address) {
            continue;
        }
        let outcome = upsert_account(state, address, now, Some(incoming), now);
        if account_history && outcome.metadata_changed {
            record_account_metadata_revision(state, address, now);
        }
    }

    for posting in &transaction.postings {
        insert_move(
            state,
            maintain_pcv,
            maintain_pcev,
            transaction.id,
            posting.source.as_str(),
            &posting.asset,
            &posting.amount,
            true,
            now,
            transaction.timestamp,
        );
        insert_move(
            state,
            maintain_pcv,
            maintain_pcev,
            transaction.id,
            posting.destination.as_str(),
            &posting.asset,
            &posting.amount,
            false,
            now,
            transaction.timestamp,
        );
    }
}

fn post_commit_volumes_of(
    state: &LedgerState,
    transaction: &Transaction,
) -> crate::core::PostCommitVolumes {
    let mut out = crate::core::PostCommitVolumes::new();
    for posting in &transaction.postings {
        for account in [&posting.source, &posting.destination] {
            let entry = out.entry(account.as_str().to_string()).or_default();
            entry.insert(
                posting.asset.clone(),
                pcv_at(state, account.as_str(), &posting.asset, None, false),
            );
        }
    }
    out
}

fn append_log(
    state: &mut LedgerState,
    hash_logs: bool,
    data: LogData,
    now: DateTime<Utc>,
    idempotency: Option<IdempotencyInfo>,
) -> Log {
    let id = state.logs.len() as u64;
    let mut log = Log::new(id, now, data);
    if hash_logs {
        let previous = state.logs.last().and_then(|l| l.hash.as_deref());
        log = log.chained_after(previous);
    }
    if let Some(info) = idempotency {
        log.idempotency_key = Some(info.key);
        log.idempotency_hash = Some(info.hash);
    }
    state.logs.push(log.clone());
    log
}

fn check_idempotency_key(
    state: &LedgerState,
    idempotency: &Option<IdempotencyInfo>,
) -> Result<(), LedgerError> {
    if let Some(info) = idempotency {
        if state
            .logs
            .iter()
            .any(|l| l.idempotency_key.as_deref() == Some(info.key.as_str()))
        {
            return Err(LedgerError::IdempotencyKeyConflict(info.key.clone()));
        }
    }
    Ok(())
}

// ── Filter evaluation ─────────────────────────────────────────────────────

fn metadata_matches(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => false,
        Some(value) => match (value, expected) {
            // containment for objects, equality otherwise
            (Value::Object(outer), Value::Object(inner)) => inner
                .iter()
                .all(|(key, expected)| outer.get(key) == Some(expected)),
            (actual, expected) => actual == expected,
        },
    }
}

fn eval_account_filter(
    state: &LedgerState,
    filter: &Filter,
    account: &Account,
    metadata: &Metadata,
    pit: Option<DateTime<Utc>>,
) -> Result<bool, LedgerError> {
    filter.evaluate(&|operator, key, value| match parse_key(key) {
        FilterKey::Plain("address") => {
            let pattern = value
                .as_str()
                .ok_or_else(|| LedgerError::InvalidQuery("address expects a string".into()))?;
            match_address(pattern, account.address.as_str())
        }
        FilterKey::Plain("metadata") => {
            let metadata_key = value
                .as_str()
                .ok_or_else(|| LedgerError::InvalidQuery("$exists expects a key name".into()))?;
            Ok(metadata.contains_key(metadata_key))
        }
        FilterKey::Indexed {
            base: "metadata",
            arg,
        } => Ok(metadata_matches(metadata.get(arg), value)),
        FilterKey::Plain("balance") => {
            for asset in assets_of(state, account.address.as_str()) {
                let balance = pcv_at(state, account.address.as_str(), &asset, pit, false).balance();
                if compare_amount(operator, &balance, value)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        FilterKey::Indexed {
            base: "balance",
            arg,
        } => {
            let balance = pcv_at(state, account.address.as_str(), arg, pit, false).balance();
            compare_amount(operator, &balance, value)
        }
        _ => Err(LedgerError::InvalidQuery(format!("unknown key '{}'", key))),
    })
}

fn eval_transaction_filter(
    filter: &Filter,
    transaction: &Transaction,
    metadata: &Metadata,
) -> Result<bool, LedgerError> {
    filter.evaluate(&|operator, key, value| match parse_key(key) {
        FilterKey::Plain("id") => compare_amount(
            operator,
            &Amount::from(transaction.id as i64),
            value,
        ),
        FilterKey::Plain("reference") => {
            Ok(transaction.reference.as_deref() == value.as_str())
        }
        FilterKey::Plain("account") => {
            let pattern = value
                .as_str()
                .ok_or_else(|| LedgerError::InvalidQuery("account expects a string".into()))?;
            for address in transaction.involved_accounts() {
                if match_address(pattern, address.as_str())? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        FilterKey::Plain("source") => {
            let pattern = value
                .as_str()
                .ok_or_else(|| LedgerError::InvalidQuery("source expects a string".into()))?;
            for posting in &transaction.postings {
                if match_address(pattern, posting.source.as_str())? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        FilterKey::Plain("destination") => {
            let pattern = value
                .as_str()
                .ok_or_else(|| LedgerError::InvalidQuery("destination expects a string".into()))?;
            for posting in &transaction.postings {
                if match_address(pattern, posting.destination.as_str())? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        FilterKey::Plain("timestamp") => {
            let raw = value
                .as_str()
                .ok_or_else(|| LedgerError::InvalidQuery("timestamp expects RFC3339".into()))?;
            let bound = DateTime::parse_from_rfc3339(raw)
                .map_err(|err| LedgerError::InvalidQuery(format!("bad timestamp: {}", err)))?
                .with_timezone(&Utc);
            Ok(match operator {
                Operator::Match => transaction.timestamp == bound,
                Operator::Lt => transaction.timestamp < bound,
                Operator::Lte => transaction.timestamp <= bound,
                Operator::Gt => transaction.timestamp > bound,
                Operator::Gte => transaction.timestamp >= bound,
                Operator::Exists => false,
            })
        }
        FilterKey::Plain("reverted") => {
            Ok(value.as_bool() == Some(transaction.reverted_at.is_some()))
        }
        FilterKey::Plain("metadata") => {
            let metadata_key = value
                .as_str()
                .ok_or_else(|| LedgerError::InvalidQuery("$exists expects a key name".into()))?;
            Ok(metadata.contains_key(metadata_key))
        }
        FilterKey::Indexed {
            base: "metadata",
            arg,
        } => Ok(metadata_matches(metadata.get(arg), value)),
        _ => Err(LedgerError::InvalidQuery(format!("unknown key '{}'", key))),
    })
}

fn paginate<T>(items: Vec<T>, page: &Page) -> (Vec<T>, bool) {
    let offset = page.offset as usize;
    let size = page.page_size as usize;
    let has_more = items.len() > offset.saturating_add(size);
    let data = items.into_iter().skip(offset).take(size).collect();
    (data, has_more)
}

// ── Trait implementations ─────────────────────────────────────────────────

#[async_trait]
impl BalanceReader for MemoryLedgerStore {
    async fn get_balance(
        &self,
        address: &AccountAddress,
        asset: &str,
    ) -> Result<Amount, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(current_balance(&state, address.as_str(), asset))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    async fn is_up_to_date(&self) -> Result<bool, LedgerError> {
        Ok(true)
    }

    async fn commit(&self, plan: CommitPlan) -> Result<CommitOutcome, LedgerError> {
        let mut state = self.state.lock().unwrap();

        // ── Phase 1: Verify under lock ───────────────────────────────────
        let last_timestamp = state.transactions.iter().map(|t| t.timestamp).max();
        if let Some(last) = last_timestamp {
            if plan.timestamp < last && !plan.allow_backdating {
                return Err(LedgerError::InvalidTimestamp(format!(
                    "{} is before the ledger head {}",
                    plan.timestamp, last
                )));
            }
        }

        if let Some(reverted_id) = plan.reverts {
            let original = state
                .transactions
                .get(reverted_id as usize)
                .ok_or(LedgerError::NotFound)?;
            if original.is_reverted() {
                return Err(LedgerError::AlreadyReverted(reverted_id));
            }
        }

        if let Some(reference) = &plan.reference {
            if state
                .transactions
                .iter()
                .any(|t| t.reference.as_deref() == Some(reference.as_str()))
            {
                return Err(LedgerError::ReferenceConflict(reference.clone()));
            }
        }

        check_idempotency_key(&state, &plan.idempotency)?;

        if !plan.skip_balance_checks {
            let mut balances: BTreeMap<(String, String), Amount> = BTreeMap::new();
            for posting in &plan.postings {
                for account in [&posting.source, &posting.destination] {
                    balances
                        .entry((account.as_str().to_string(), posting.asset.clone()))
                        .or_insert_with(|| {
                            current_balance(&state, account.as_str(), &posting.asset)
                        });
                }
            }
            check_balances(&plan.postings, &mut balances)?;
        }

        // ── Phase 2: Apply ───────────────────────────────────────────────
        let now = Utc::now();
        let id = state.transactions.len() as u64;
        let mut transaction = Transaction {
            id,
            postings: plan.postings.clone(),
            timestamp: plan.timestamp,
            inserted_at: now,
            updated_at: now,
            reference: plan.reference.clone(),
            metadata: plan.metadata.clone(),
            reverted_at: None,
            post_commit_volumes: None,
        };

        apply_transaction(
            &mut state,
            &self.ledger.features,
            &transaction,
            &plan.account_metadata,
        );

        if self.feature(Feature::MovesHistory) {
            transaction.post_commit_volumes = Some(post_commit_volumes_of(&state, &transaction));
        }
        state.transactions.push(transaction.clone());
        if self.feature(Feature::TransactionMetadataHistory) && !transaction.metadata.is_empty() {
            record_transaction_metadata_revision(&mut state, id, now);
        }

        if let Some(reverted_id) = plan.reverts {
            state.transactions[reverted_id as usize].reverted_at = Some(now);
            state.transactions[reverted_id as usize].updated_at = now;
        }

        // ── Phase 3: Log ─────────────────────────────────────────────────
        let data = match plan.reverts {
            Some(reverted_id) => LogData::RevertedTransaction {
                reverted_transaction_id: reverted_id,
                transaction: transaction.clone(),
            },
            None => LogData::NewTransaction {
                transaction: transaction.clone(),
                account_metadata: plan.account_metadata.clone(),
            },
        };
        let log = append_log(
            &mut state,
            self.feature(Feature::HashLogs),
            data,
            now,
            plan.idempotency,
        );

        debug!(ledger = %self.ledger.name, id, "transaction committed");
        Ok(CommitOutcome { transaction, log })
    }

    async fn save_account_metadata(
        &self,
        address: &AccountAddress,
        metadata: Metadata,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError> {
        let mut state = self.state.lock().unwrap();
        check_idempotency_key(&state, &idempotency)?;

        let now = Utc::now();
        let outcome = upsert_account(&mut state, address.as_str(), now, Some(&metadata), now);
        if self.feature(Feature::AccountMetadataHistory) && outcome.metadata_changed {
            record_account_metadata_revision(&mut state, address.as_str(), now);
        }

        Ok(append_log(
            &mut state,
            self.feature(Feature::HashLogs),
            LogData::SetMetadata {
                target_type: MetadataTarget::Account,
                target_id: address.as_str().to_string(),
                metadata,
            },
            now,
            idempotency,
        ))
    }

    async fn delete_account_metadata(
        &self,
        address: &AccountAddress,
        key: &str,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError> {
        let mut state = self.state.lock().unwrap();
        check_idempotency_key(&state, &idempotency)?;

        let now = Utc::now();
        let changed = match state.accounts.get_mut(address.as_str()) {
            Some(account) => {
                let removed = account.metadata.remove(key).is_some();
                if removed {
                    account.updated_at = now;
                }
                removed
            }
            None => return Err(LedgerError::NotFound),
        };
        if self.feature(Feature::AccountMetadataHistory) && changed {
            record_account_metadata_revision(&mut state, address.as_str(), now);
        }

        Ok(append_log(
            &mut state,
            self.feature(Feature::HashLogs),
            LogData::DeleteMetadata {
                target_type: MetadataTarget::Account,
                target_id: address.as_str().to_string(),
                key: key.to_string(),
            },
            now,
            idempotency,
        ))
    }

    async fn save_transaction_metadata(
        &self,
        id: u64,
        metadata: Metadata,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError> {
        let mut state = self.state.lock().unwrap();
        check_idempotency_key(&state, &idempotency)?;

        let now = Utc::now();
        let changed = {
            let transaction = state
                .transactions
                .get_mut(id as usize)
                .ok_or(LedgerError::NotFound)?;
            let changed = metadata::merge(&mut transaction.metadata, &metadata);
            if changed {
                transaction.updated_at = now;
            }
            changed
        };
        if self.feature(Feature::TransactionMetadataHistory) && changed {
            record_transaction_metadata_revision(&mut state, id, now);
        }

        Ok(append_log(
            &mut state,
            self.feature(Feature::HashLogs),
            LogData::SetMetadata {
                target_type: MetadataTarget::Transaction,
                target_id: id.to_string(),
                metadata,
            },
            now,
            idempotency,
        ))
    }

    async fn delete_transaction_metadata(
        &self,
        id: u64,
        key: &str,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError> {
        let mut state = self.state.lock().unwrap();
        check_idempotency_key(&state, &idempotency)?;

        let now = Utc::now();
        let changed = {
            let transaction = state
                .transactions
                .get_mut(id as usize)
                .ok_or(LedgerError::NotFound)?;
            let removed = transaction.metadata.remove(key).is_some();
            if removed {
                transaction.updated_at = now;
            }
            removed
        };
        if self.feature(Feature::TransactionMetadataHistory) && changed {
            record_transaction_metadata_revision(&mut state, id, now);
        }

        Ok(append_log(
            &mut state,
            self.feature(Feature::HashLogs),
            LogData::DeleteMetadata {
                target_type: MetadataTarget::Transaction,
                target_id: id.to_string(),
                key: key.to_string(),
            },
            now,
            idempotency,
        ))
    }

    async fn get_account(&self, query: GetAccountQuery) -> Result<Option<Account>, LedgerError> {
        let state = self.state.lock().unwrap();
        let account = match state.accounts.get(query.address.as_str()) {
            Some(account) => account,
            None => return Ok(None),
        };
        if let Some(pit) = query.pit {
            if account.first_usage > pit {
                return Ok(None);
            }
        }

        let mut out = account.clone();
        if let Some(pit) = query.pit {
            if self.feature(Feature::AccountMetadataHistory) {
                out.metadata = metadata_at(
                    state
                        .account_metadata_history
                        .get(query.address.as_str())
                        .map(Vec::as_slice)
                        .unwrap_or(&[]),
                    pit,
                );
            }
        }
        if query.expand_volumes {
            let mut volumes = VolumesByAsset::new();
            for asset in assets_of(&state, query.address.as_str()) {
                volumes.insert(
                    asset.clone(),
                    pcv_at(&state, query.address.as_str(), &asset, query.pit, false),
                );
            }
            out.volumes = Some(volumes);
        }
        if query.expand_effective_volumes {
            let mut volumes = VolumesByAsset::new();
            for asset in assets_of(&state, query.address.as_str()) {
                volumes.insert(
                    asset.clone(),
                    pcev_at(&state, query.address.as_str(), &asset, query.pit),
                );
            }
            out.effective_volumes = Some(volumes);
        }
        Ok(Some(out))
    }

    async fn list_accounts(
        &self,
        options: AccountsQueryOptions,
        page: Page,
    ) -> Result<(Vec<Account>, bool), LedgerError> {
        let state = self.state.lock().unwrap();
        let mut matched = Vec::new();
        for account in state.accounts.values() {
            if let Some(pit) = options.pit {
                if account.first_usage > pit {
                    continue;
                }
            }

            let metadata = match options.pit {
                Some(pit) if self.feature(Feature::AccountMetadataHistory) => metadata_at(
                    state
                        .account_metadata_history
                        .get(account.address.as_str())
                        .map(Vec::as_slice)
                        .unwrap_or(&[]),
                    pit,
                ),
                _ => account.metadata.clone(),
            };

            if let Some(filter) = &options.filter {
                if !eval_account_filter(&state, filter, account, &metadata, options.pit)? {
                    continue;
                }
            }

            let mut out = account.clone();
            out.metadata = metadata;
            if options.expand_volumes {
                let mut volumes = VolumesByAsset::new();
                for asset in assets_of(&state, account.address.as_str()) {
                    volumes.insert(
                        asset.clone(),
                        pcv_at(&state, account.address.as_str(), &asset, options.pit, false),
                    );
                }
                out.volumes = Some(volumes);
            }
            if options.expand_effective_volumes {
                let mut volumes = VolumesByAsset::new();
                for asset in assets_of(&state, account.address.as_str()) {
                    volumes.insert(
                        asset.clone(),
                        pcev_at(&state, account.address.as_str(), &asset, options.pit),
                    );
                }
                out.effective_volumes = Some(volumes);
            }
            matched.push(out);
        }
        Ok(paginate(matched, &page))
    }

    async fn count_accounts(&self, options: AccountsQueryOptions) -> Result<u64, LedgerError> {
        let (data, _) = self
            .list_accounts(
                options,
                Page {
                    page_size: u64::MAX,
                    offset: 0,
                },
            )
            .await?;
        Ok(data.len() as u64)
    }

    async fn get_transaction(
        &self,
        id: u64,
        pit: Option<DateTime<Utc>>,
    ) -> Result<Option<Transaction>, LedgerError> {
        let state = self.state.lock().unwrap();
        let transaction = match state.transactions.get(id as usize) {
            Some(transaction) => transaction,
            None => return Ok(None),
        };
        if let Some(pit) = pit {
            if transaction.timestamp > pit {
                return Ok(None);
            }
        }

        let mut out = transaction.clone();
        if let Some(pit) = pit {
            if self.feature(Feature::TransactionMetadataHistory) {
                out.metadata = metadata_at(
                    state
                        .transaction_metadata_history
                        .get(&id)
                        .map(Vec::as_slice)
                        .unwrap_or(&[]),
                    pit,
                );
            }
        }
        Ok(Some(out))
    }

    async fn list_transactions(
        &self,
        options: TransactionsQueryOptions,
        page: Page,
    ) -> Result<(Vec<Transaction>, bool), LedgerError> {
        let state = self.state.lock().unwrap();
        let mut matched = Vec::new();
        for transaction in state.transactions.iter().rev() {
            if let Some(pit) = options.pit {
                if transaction.timestamp > pit {
                    continue;
                }
            }

            let metadata = match options.pit {
                Some(pit) if self.feature(Feature::TransactionMetadataHistory) => metadata_at(
                    state
                        .transaction_metadata_history
                        .get(&transaction.id)
                        .map(Vec::as_slice)
                        .unwrap_or(&[]),
                    pit,
                ),
                _ => transaction.metadata.clone(),
            };

            if let Some(filter) = &options.filter {
                if !eval_transaction_filter(filter, transaction, &metadata)? {
                    continue;
                }
            }

            let mut out = transaction.clone();
            out.metadata = metadata;
            matched.push(out);
        }
        Ok(paginate(matched, &page))
    }

    async fn count_transactions(
        &self,
        options: TransactionsQueryOptions,
    ) -> Result<u64, LedgerError> {
        let (data, _) = self
            .list_transactions(
                options,
                Page {
                    page_size: u64::MAX,
                    offset: 0,
                },
            )
            .await?;
        Ok(data.len() as u64)
    }

    async fn aggregated_balances(
        &self,
        query: AggregatedBalancesQuery,
    ) -> Result<VolumesByAsset, LedgerError> {
        let state = self.state.lock().unwrap();
        let mut out = VolumesByAsset::new();
        for account in state.accounts.values() {
            if let Some(filter) = &query.filter {
                if !eval_account_filter(&state, filter, account, &account.metadata, query.pit)? {
                    continue;
                }
            }
            for asset in assets_of(&state, account.address.as_str()) {
                let volumes = if query.use_insertion_date {
                    pcv_at(&state, account.address.as_str(), &asset, query.pit, true)
                } else {
                    pcev_at(&state, account.address.as_str(), &asset, query.pit)
                };
                aggregate_volumes(&mut out, &asset, &volumes);
            }
        }
        Ok(out)
    }

    async fn volumes_with_balances(
        &self,
        options: VolumesQueryOptions,
        page: Page,
    ) -> Result<(Vec<VolumesWithBalance>, bool), LedgerError> {
        let state = self.state.lock().unwrap();
        let mut grouped: BTreeMap<(String, String), Volumes> = BTreeMap::new();
        for account in state.accounts.values() {
            if let Some(filter) = &options.filter {
                if !eval_account_filter(&state, filter, account, &account.metadata, options.pit)? {
                    continue;
                }
            }
            let group = match options.group_by {
                Some(depth) => group_address(account.address.as_str(), depth),
                None => account.address.as_str().to_string(),
            };
            for asset in assets_of(&state, account.address.as_str()) {
                let volumes = if options.use_insertion_date {
                    pcv_at(&state, account.address.as_str(), &asset, options.pit, true)
                } else {
                    pcev_at(&state, account.address.as_str(), &asset, options.pit)
                };
                grouped
                    .entry((group.clone(), asset))
                    .and_modify(|v| *v = v.add(&volumes))
                    .or_insert(volumes);
            }
        }
        let rows: Vec<VolumesWithBalance> = grouped
            .into_iter()
            .map(|((account, asset), volumes)| VolumesWithBalance {
                balance: volumes.balance(),
                input: volumes.input,
                output: volumes.output,
                account,
                asset,
            })
            .collect();
        Ok(paginate(rows, &page))
    }

    async fn list_logs(
        &self,
        options: LogsQueryOptions,
        page: Page,
    ) -> Result<(Vec<Log>, bool), LedgerError> {
        let state = self.state.lock().unwrap();
        let matched: Vec<Log> = state
            .logs
            .iter()
            .rev()
            .filter(|log| match options.start_time {
                Some(start) => log.date >= start,
                None => true,
            })
            .filter(|log| match options.end_time {
                Some(end) => log.date < end,
                None => true,
            })
            .filter(|log| match options.after_id {
                Some(after) => log.id < after,
                None => true,
            })
            .cloned()
            .collect();
        Ok(paginate(matched, &page))
    }

    async fn last_log(&self) -> Result<Option<Log>, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state.logs.last().cloned())
    }

    async fn log_by_idempotency_key(&self, key: &str) -> Result<Option<Log>, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .iter()
            .find(|l| l.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn last_committed_timestamp(&self) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state.transactions.iter().map(|t| t.timestamp).max())
    }

    async fn read_logs(&self) -> Result<Vec<Log>, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state.logs.clone())
    }

    async fn import_logs(&self, logs: Vec<Log>) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        let start_id = state.logs.len() as u64;
        let previous_hash = state.logs.last().and_then(|l| l.hash.clone());
        verify_chain(&logs, start_id, previous_hash)?;

        for log in logs {
            match &log.data {
                LogData::NewTransaction {
                    transaction,
                    account_metadata,
                } => {
                    if transaction.id != state.transactions.len() as u64 {
                        return Err(LedgerError::ImportHashMismatch(log.id));
                    }
                    apply_transaction(
                        &mut state,
                        &self.ledger.features,
                        transaction,
                        account_metadata,
                    );
                    state.transactions.push(transaction.clone());
                }
                LogData::RevertedTransaction {
                    reverted_transaction_id,
                    transaction,
                } => {
                    if transaction.id != state.transactions.len() as u64 {
                        return Err(LedgerError::ImportHashMismatch(log.id));
                    }
                    apply_transaction(
                        &mut state,
                        &self.ledger.features,
                        transaction,
                        &BTreeMap::new(),
                    );
                    state.transactions.push(transaction.clone());
                    let reverted = *reverted_transaction_id as usize;
                    if let Some(original) = state.transactions.get_mut(reverted) {
                        original.reverted_at = Some(log.date);
                        original.updated_at = log.date;
                    }
                }
                LogData::SetMetadata {
                    target_type: MetadataTarget::Account,
                    target_id,
                    metadata,
                } => {
                    let outcome =
                        upsert_account(&mut state, target_id, log.date, Some(metadata), log.date);
                    if self.feature(Feature::AccountMetadataHistory) && outcome.metadata_changed {
                        record_account_metadata_revision(&mut state, target_id, log.date);
                    }
                }
                LogData::SetMetadata {
                    target_type: MetadataTarget::Transaction,
                    target_id,
                    metadata,
                } => {
                    let id: u64 = target_id
                        .parse()
                        .map_err(|_| LedgerError::ImportHashMismatch(log.id))?;
                    let changed = {
                        let transaction = state
                            .transactions
                            .get_mut(id as usize)
                            .ok_or(LedgerError::ImportHashMismatch(log.id))?;
                        metadata::merge(&mut transaction.metadata, metadata)
                    };
                    if self.feature(Feature::TransactionMetadataHistory) && changed {
                        record_transaction_metadata_revision(&mut state, id, log.date);
                    }
                }
                LogData::DeleteMetadata {
                    target_type: MetadataTarget::Account,
                    target_id,
                    key,
                } => {
                    if let Some(account) = state.accounts.get_mut(target_id) {
                        account.metadata.remove(key);
                    }
                }
                LogData::DeleteMetadata {
                    target_type: MetadataTarget::Transaction,
                    target_id,
                    key,
                } => {
                    let id: u64 = target_id
                        .parse()
                        .map_err(|_| LedgerError::ImportHashMismatch(log.id))?;
                    if let Some(transaction) = state.transactions.get_mut(id as usize) {
                        transaction.metadata.remove(key);
                    }
                }
            }
            state.logs.push(log);
        }
        Ok(())
    }
}

/// Catalog and store factory backed by process memory.
#[derive(Default)]
pub struct MemoryDriver {
    ledgers: Mutex<BTreeMap<String, Ledger>>,
    stores: Mutex<BTreeMap<String, Arc<MemoryLedgerStore>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn insert_ledger(&self, ledger: &Ledger) -> Result<(), LedgerError> {
        let mut ledgers = self.ledgers.lock().unwrap();
        if ledgers.contains_key(&ledger.name) {
            return Err(LedgerError::LedgerAlreadyExists(ledger.name.clone()));
        }
        ledgers.insert(ledger.name.clone(), ledger.clone());
        Ok(())
    }

    async fn get_ledger(&self, name: &str) -> Result<Option<Ledger>, LedgerError> {
        Ok(self.ledgers.lock().unwrap().get(name).cloned())
    }

    async fn list_ledgers(&self) -> Result<Vec<Ledger>, LedgerError> {
        Ok(self.ledgers.lock().unwrap().values().cloned().collect())
    }

    async fn update_ledger_state(&self, name: &str, state: State) -> Result<(), LedgerError> {
        let mut ledgers = self.ledgers.lock().unwrap();
        let ledger = ledgers.get_mut(name).ok_or(LedgerError::NotFound)?;
        ledger.state = state;
        Ok(())
    }

    async fn update_ledger_metadata(
        &self,
        name: &str,
        metadata: Metadata,
    ) -> Result<(), LedgerError> {
        let mut ledgers = self.ledgers.lock().unwrap();
        let ledger = ledgers.get_mut(name).ok_or(LedgerError::NotFound)?;
        metadata::merge(&mut ledger.metadata, &metadata);
        Ok(())
    }

    async fn delete_ledger_metadata(&self, name: &str, key: &str) -> Result<(), LedgerError> {
        let mut ledgers = self.ledgers.lock().unwrap();
        let ledger = ledgers.get_mut(name).ok_or(LedgerError::NotFound)?;
        ledger.metadata.remove(key);
        Ok(())
    }

    async fn migrate_bucket(&self, _bucket: &str) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn open_store(&self, ledger: Ledger) -> Result<Arc<dyn LedgerStore>, LedgerError> {
        let mut stores = self.stores.lock().unwrap();
        let store = stores
            .entry(ledger.name.clone())
            .or_insert_with(|| Arc::new(MemoryLedgerStore::new(ledger)))
            .clone();
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Posting;
    use crate::registry::ledger::LedgerConfig;

    fn store() -> MemoryLedgerStore {
        MemoryLedgerStore::new(Ledger::new("test", LedgerConfig::default()).unwrap())
    }

    fn posting(source: &str, destination: &str, amount: i64) -> Posting {
        Posting::new(
            AccountAddress::new(source).unwrap(),
            AccountAddress::new(destination).unwrap(),
            Amount::from(amount),
            "USD",
        )
    }

    #[tokio::test]
    async fn commit_assigns_dense_ids() {
        let store = store();
        for expected in 0..3u64 {
            let outcome = store
                .commit(CommitPlan::for_postings(
                    vec![posting("world", "alice", 10)],
                    Utc::now(),
                ))
                .await
                .unwrap();
            assert_eq!(outcome.transaction.id, expected);
            assert_eq!(outcome.log.id, expected);
        }
    }

    #[tokio::test]
    async fn move_consistency_under_backdating() {
        let store = store();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::hours(1);
        let t2 = t0 + chrono::Duration::hours(2);

        let mut plan = CommitPlan::for_postings(vec![posting("world", "alice", 100)], t0);
        store.commit(plan).await.unwrap();

        plan = CommitPlan::for_postings(vec![posting("world", "alice", 50)], t2);
        store.commit(plan).await.unwrap();

        // back-dated between the two
        plan = CommitPlan::for_postings(vec![posting("world", "alice", 7)], t1);
        plan.allow_backdating = true;
        store.commit(plan).await.unwrap();

        let state = store.state.lock().unwrap();
        // effective trail must be cumulative in effective order
        let mut trail: Vec<&Move> = state
            .moves
            .iter()
            .filter(|m| m.account == "alice")
            .collect();
        trail.sort_by_key(|m| (m.effective_date, m.seq));
        let mut running = Volumes::zero();
        for m in trail {
            running = running.apply(&m.amount, m.is_source);
            assert_eq!(m.post_commit_effective_volumes.as_ref(), Some(&running));
        }

        // insertion trail likewise
        let mut trail: Vec<&Move> = state
            .moves
            .iter()
            .filter(|m| m.account == "alice")
            .collect();
        trail.sort_by_key(|m| m.seq);
        let mut running = Volumes::zero();
        for m in trail {
            running = running.apply(&m.amount, m.is_source);
            assert_eq!(m.post_commit_volumes.as_ref(), Some(&running));
        }
    }

    #[tokio::test]
    async fn pit_balance_uses_effective_dates() {
        let store = store();
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::hours(1);
        let t3 = t1 + chrono::Duration::hours(2);

        store
            .commit(CommitPlan::for_postings(
                vec![posting("world", "alice", 100)],
                t1,
            ))
            .await
            .unwrap();
        store
            .commit(CommitPlan::for_postings(
                vec![posting("world", "alice", 50)],
                t3,
            ))
            .await
            .unwrap();

        let mut query = GetAccountQuery::new(AccountAddress::new("alice").unwrap());
        query.pit = Some(t2);
        query.expand_volumes = true;
        let account = store.get_account(query).await.unwrap().unwrap();
        assert_eq!(
            account.volumes.unwrap()["USD"].balance(),
            Amount::from(100)
        );
    }
}
