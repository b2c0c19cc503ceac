// src/engine/mod.rs
//
// The commit controller: parameter normalization, script evaluation,
// validation, idempotency, timestamp resolution, and the deadlock retry
// loop around the store's atomic commit.
pub mod numscript;
pub mod plan;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::adapters::{CommitOutcome, LedgerStore};
use crate::core::{canonical_hash, Log, LogData, Metadata, Transaction, TransactionData};
use crate::engine::numscript::ScriptEvaluator;
use crate::engine::plan::{CommitPlan, IdempotencyInfo};
use crate::error::{LedgerError, ScriptErrorKind};
use crate::registry::features::Feature;
use crate::registry::ledger::Ledger;

const MAX_COMMIT_RETRIES: u32 = 20;

/// A script payload as submitted by clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunScript {
    pub plain: String,
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
}

/// Either plain postings or a script to evaluate against ledger state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionInput {
    Postings(TransactionData),
    Script {
        script: RunScript,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
        #[serde(default)]
        metadata: Metadata,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RevertOptions {
    /// Skip the sufficient-funds check on the compensating postings.
    pub force: bool,
    /// Back-date the compensating transaction.
    pub at_effective_date: Option<DateTime<Utc>>,
}

/// Commit and mutation pipeline for one ledger.
#[derive(Clone)]
pub struct LedgerController {
    ledger: Ledger,
    store: Arc<dyn LedgerStore>,
    evaluator: Arc<dyn ScriptEvaluator>,
}

impl LedgerController {
    pub fn new(
        ledger: Ledger,
        store: Arc<dyn LedgerStore>,
        evaluator: Arc<dyn ScriptEvaluator>,
    ) -> Self {
        Self {
            ledger,
            store,
            evaluator,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub async fn is_database_up_to_date(&self) -> Result<bool, LedgerError> {
        self.store.is_up_to_date().await
    }

    async fn guard_schema(&self) -> Result<(), LedgerError> {
        if !self.store.is_up_to_date().await? {
            return Err(LedgerError::OutdatedSchema(self.ledger.bucket.clone()));
        }
        Ok(())
    }

    /// Create one transaction from postings or a script.
    pub async fn create_transaction(
        &self,
        input: TransactionInput,
        idempotency_key: Option<String>,
    ) -> Result<CommitOutcome, LedgerError> {
        self.guard_schema().await?;

        let idempotency = match idempotency_key {
            Some(key) => {
                let hash = canonical_hash(
                    &serde_json::to_value(&input).map_err(|err| LedgerError::internal(err.to_string()))?,
                );
                if let Some(stored) = self.store.log_by_idempotency_key(&key).await? {
                    return replay_commit(&key, &hash, stored);
                }
                Some(IdempotencyInfo { key, hash })
            }
            None => None,
        };

        let (postings, timestamp, reference, metadata, account_metadata) =
            match input {
                TransactionInput::Postings(data) => {
                    data.validate()?;
                    (
                        data.postings,
                        data.timestamp,
                        data.reference,
                        data.metadata,
                        BTreeMap::new(),
                    )
                }
                TransactionInput::Script {
                    script,
                    timestamp,
                    reference,
                    metadata,
                } => {
                    let result = self
                        .evaluator
                        .evaluate(&script.plain, &script.vars, self.store.as_ref())
                        .await?;

                    // the caller's metadata wins; a script overriding one of
                    // the caller's keys with a different value is an error
                    let mut merged = metadata;
                    for (key, value) in result.transaction_metadata {
                        match merged.get(&key) {
                            Some(existing) if *existing != value => {
                                return Err(LedgerError::MetadataOverride(key));
                            }
                            Some(_) => {}
                            None => {
                                merged.insert(key, value);
                            }
                        }
                    }

                    let data = TransactionData {
                        postings: result.postings,
                        timestamp,
                        reference,
                        metadata: merged,
                    };
                    data.validate().map_err(|err| match err {
                        LedgerError::NoPostings => LedgerError::NoPostings,
                        LedgerError::Validation(message) => LedgerError::Script {
                            kind: ScriptErrorKind::Compilation,
                            message,
                        },
                        other => other,
                    })?;
                    (
                        data.postings,
                        data.timestamp,
                        data.reference,
                        data.metadata,
                        result.account_metadata,
                    )
                }
            };

        let allow_backdating = self
            .ledger
            .features
            .is_enabled(Feature::MovesHistoryPostCommitEffectiveVolumes);
        let timestamp = match timestamp {
            Some(requested) => {
                if !allow_backdating {
                    if let Some(head) = self.store.last_committed_timestamp().await? {
                        if requested < head {
                            return Err(LedgerError::InvalidTimestamp(format!(
                                "{} is before the ledger head {}",
                                requested, head
                            )));
                        }
                    }
                }
                requested
            }
            None => Utc::now(),
        };

        let mut commit_plan = CommitPlan::for_postings(postings, timestamp);
        commit_plan.allow_backdating = allow_backdating;
        commit_plan.reference = reference;
        commit_plan.metadata = metadata;
        commit_plan.account_metadata = account_metadata;
        commit_plan.idempotency = idempotency;

        self.commit_with_retries(commit_plan).await
    }

    /// Revert a committed transaction with a compensating one.
    pub async fn revert_transaction(
        &self,
        id: u64,
        options: RevertOptions,
    ) -> Result<CommitOutcome, LedgerError> {
        self.guard_schema().await?;

        let original = self
            .store
            .get_transaction(id, None)
            .await?
            .ok_or(LedgerError::NotFound)?;
        if original.is_reverted() {
            return Err(LedgerError::AlreadyReverted(id));
        }

        let allow_backdating = self
            .ledger
            .features
            .is_enabled(Feature::MovesHistoryPostCommitEffectiveVolumes);
        let reversal = original.reversal(options.at_effective_date);

        let mut commit_plan = CommitPlan::for_postings(
            reversal.postings,
            reversal.timestamp.unwrap_or_else(Utc::now),
        );
        commit_plan.allow_backdating = allow_backdating;
        commit_plan.reverts = Some(id);
        commit_plan.skip_balance_checks = options.force;

        self.commit_with_retries(commit_plan).await
    }

    pub async fn save_transaction_metadata(
        &self,
        id: u64,
        metadata: Metadata,
        idempotency_key: Option<String>,
    ) -> Result<Log, LedgerError> {
        self.guard_schema().await?;
        let idempotency = self
            .resolve_metadata_idempotency(
                idempotency_key,
                serde_json::json!({
                    "target_type": "TRANSACTION",
                    "target_id": id,
                    "metadata": metadata,
                }),
            )
            .await?;
        match idempotency {
            Resolved::Replayed(log) => Ok(log),
            Resolved::Fresh(info) => {
                self.store
                    .save_transaction_metadata(id, metadata, info)
                    .await
            }
        }
    }

    pub async fn delete_transaction_metadata(
        &self,
        id: u64,
        key: &str,
        idempotency_key: Option<String>,
    ) -> Result<Log, LedgerError> {
        self.guard_schema().await?;
        let idempotency = self
            .resolve_metadata_idempotency(
                idempotency_key,
                serde_json::json!({
                    "target_type": "TRANSACTION",
                    "target_id": id,
                    "key": key,
                }),
            )
            .await?;
        match idempotency {
            Resolved::Replayed(log) => Ok(log),
            Resolved::Fresh(info) => self.store.delete_transaction_metadata(id, key, info).await,
        }
    }

    pub async fn save_account_metadata(
        &self,
        address: &crate::core::AccountAddress,
        metadata: Metadata,
        idempotency_key: Option<String>,
    ) -> Result<Log, LedgerError> {
        self.guard_schema().await?;
        let idempotency = self
            .resolve_metadata_idempotency(
                idempotency_key,
                serde_json::json!({
                    "target_type": "ACCOUNT",
                    "target_id": address.as_str(),
                    "metadata": metadata,
                }),
            )
            .await?;
        match idempotency {
            Resolved::Replayed(log) => Ok(log),
            Resolved::Fresh(info) => {
                self.store
                    .save_account_metadata(address, metadata, info)
                    .await
            }
        }
    }

    pub async fn delete_account_metadata(
        &self,
        address: &crate::core::AccountAddress,
        key: &str,
        idempotency_key: Option<String>,
    ) -> Result<Log, LedgerError> {
        self.guard_schema().await?;
        let idempotency = self
            .resolve_metadata_idempotency(
                idempotency_key,
                serde_json::json!({
                    "target_type": "ACCOUNT",
                    "target_id": address.as_str(),
                    "key": key,
                }),
            )
            .await?;
        match idempotency {
            Resolved::Replayed(log) => Ok(log),
            Resolved::Fresh(info) => self.store.delete_account_metadata(address, key, info).await,
        }
    }

    /// Export the log stream in commit order.
    pub async fn export_logs(&self) -> Result<Vec<Log>, LedgerError> {
        self.store.read_logs().await
    }

    /// Import a log stream exported from another ledger. The chain must
    /// connect to this ledger's head.
    pub async fn import_logs(&self, logs: Vec<Log>) -> Result<(), LedgerError> {
        self.guard_schema().await?;
        self.store.import_logs(logs).await
    }

    async fn resolve_metadata_idempotency(
        &self,
        idempotency_key: Option<String>,
        body: Value,
    ) -> Result<Resolved, LedgerError> {
        match idempotency_key {
            None => Ok(Resolved::Fresh(None)),
            Some(key) => {
                let hash = canonical_hash(&body);
                match self.store.log_by_idempotency_key(&key).await? {
                    Some(stored) => {
                        if stored.idempotency_hash.as_deref() == Some(hash.as_str()) {
                            Ok(Resolved::Replayed(stored))
                        } else {
                            Err(LedgerError::IdempotencyViolation(key))
                        }
                    }
                    None => Ok(Resolved::Fresh(Some(IdempotencyInfo { key, hash }))),
                }
            }
        }
    }

    /// The retry state machine: prepare happened upstream; persist here,
    /// looping back on deadlock with jittered backoff, until the bound.
    async fn commit_with_retries(
        &self,
        commit_plan: CommitPlan,
    ) -> Result<CommitOutcome, LedgerError> {
        let expected = commit_plan.idempotency.clone();
        let mut attempt: u32 = 0;
        let result = loop {
            match self.store.commit(commit_plan.clone()).await {
                Err(LedgerError::Deadlock) if attempt < MAX_COMMIT_RETRIES => {
                    attempt += 1;
                    counter!("ledger.commit.retries", "ledger" => self.ledger.name.clone())
                        .increment(1);
                    warn!(
                        ledger = %self.ledger.name,
                        attempt,
                        "deadlock detected, retrying commit"
                    );
                    let jitter = rand::thread_rng().gen_range(0..20u64);
                    tokio::time::sleep(Duration::from_millis(
                        (10 * u64::from(attempt)) + jitter,
                    ))
                    .await;
                }
                Err(LedgerError::IdempotencyKeyConflict(key)) => {
                    // another writer won the race on this key: replay its result
                    let expected_hash = expected
                        .as_ref()
                        .map(|info| info.hash.clone())
                        .unwrap_or_default();
                    let stored = self
                        .store
                        .log_by_idempotency_key(&key)
                        .await?
                        .ok_or_else(|| {
                            LedgerError::internal("idempotency key registered but log missing")
                        })?;
                    break replay_commit(&key, &expected_hash, stored);
                }
                other => break other,
            }
        };

        counter!(
            "ledger.transactions.total",
            "ledger" => self.ledger.name.clone(),
            "status" => if result.is_ok() { "success" } else { "failed" },
        )
        .increment(1);

        result
    }
}

enum Resolved {
    Fresh(Option<IdempotencyInfo>),
    Replayed(Log),
}

/// Rebuild a commit outcome from a stored log, enforcing the body hash.
fn replay_commit(key: &str, hash: &str, stored: Log) -> Result<CommitOutcome, LedgerError> {
    if stored.idempotency_hash.as_deref() != Some(hash) {
        return Err(LedgerError::IdempotencyViolation(key.to_string()));
    }
    let transaction: Transaction = match &stored.data {
        LogData::NewTransaction { transaction, .. } => transaction.clone(),
        LogData::RevertedTransaction { transaction, .. } => transaction.clone(),
        _ => {
            return Err(LedgerError::internal(
                "idempotency key points at a non-transaction log",
            ))
        }
    };
    Ok(CommitOutcome {
        transaction,
        log: stored,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log::MetadataTarget;

    #[test]
    fn replay_rejects_mismatched_hash() {
        let log = {
            let mut log = Log::new(
                0,
                Utc::now(),
                LogData::SetMetadata {
                    target_type: MetadataTarget::Account,
                    target_id: "alice".to_string(),
                    metadata: Metadata::new(),
                },
            );
            log.idempotency_key = Some("k1".to_string());
            log.idempotency_hash = Some("aaaa".to_string());
            log
        };
        assert!(matches!(
            replay_commit("k1", "bbbb", log),
            Err(LedgerError::IdempotencyViolation(_))
        ));
    }

    #[test]
    fn transaction_input_serializes_stably() {
        let input = TransactionInput::Postings(TransactionData::default());
        let a = canonical_hash(&serde_json::to_value(&input).unwrap());
        let b = canonical_hash(&serde_json::to_value(&input).unwrap());
        assert_eq!(a, b);
    }
}
