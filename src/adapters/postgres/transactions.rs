// src/adapters/postgres/transactions.rs
use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::adapters::{CommitOutcome, TransactionsQueryOptions};
use crate::core::{
    AccountAddress, Log, LogData, Metadata, MetadataTarget, PostCommitVolumes, Transaction,
};
use crate::engine::plan::{check_balances, CommitPlan, IdempotencyInfo};
use crate::error::LedgerError;
use crate::query::cursor::Page;
use crate::registry::features::Feature;

use super::filter::{push_transactions_condition, TransactionsSqlContext};
use super::{map_sqlx_err, PostgresLedgerStore};

impl PostgresLedgerStore {
    /// Apply one commit plan in a single database transaction.
    ///
    /// The head row is locked first, serializing per-ledger commits: dense
    /// ids, a linear hash chain, and a stable snapshot for the balance
    /// checks all follow from that one lock. Deadlocks against concurrent
    /// writers on other ledgers of the bucket surface as
    /// `LedgerError::Deadlock` and are retried by the controller.
    pub(crate) async fn commit_impl(
        &self,
        plan: CommitPlan,
    ) -> Result<CommitOutcome, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let mut head = self.lock_head(&mut tx).await?;

        // ── Phase 1: Verify under the head lock ──────────────────────────
        if let Some(last) = head.last_tx_timestamp {
            if plan.timestamp < last && !plan.allow_backdating {
                return Err(LedgerError::InvalidTimestamp(format!(
                    "{} is before the ledger head {}",
                    plan.timestamp, last
                )));
            }
        }

        if let Some(reverted_id) = plan.reverts {
            let reverted_at: Option<DateTime<Utc>> = sqlx::query_scalar(&format!(
                "SELECT reverted_at FROM {} WHERE ledger = $1 AND id = $2 FOR UPDATE",
                self.table("transactions"),
            ))
            .bind(&self.ledger.name)
            .bind(reverted_id as i64)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(LedgerError::NotFound)?;
            if reverted_at.is_some() {
                return Err(LedgerError::AlreadyReverted(reverted_id));
            }
        }

        if !plan.skip_balance_checks {
            let pairs: Vec<(String, String)> = plan
                .postings
                .iter()
                .flat_map(|p| {
                    [
                        (p.source.as_str().to_string(), p.asset.clone()),
                        (p.destination.as_str().to_string(), p.asset.clone()),
                    ]
                })
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let mut balances = self.load_balances_in_tx(&mut tx, &pairs).await?;
            check_balances(&plan.postings, &mut balances)?;
        }

        // ── Phase 2: Apply ───────────────────────────────────────────────
        let now = Utc::now();
        let id = (head.last_tx_id + 1) as u64;

        let involved: BTreeSet<String> = plan
            .postings
            .iter()
            .flat_map(|p| {
                [
                    p.source.as_str().to_string(),
                    p.destination.as_str().to_string(),
                ]
            })
            .collect();
        for address in &involved {
            let metadata_changed = self
                .upsert_account_in_tx(
                    &mut tx,
                    address,
                    plan.timestamp,
                    plan.account_metadata.get(address),
                    now,
                )
                .await?;
            if self.feature(Feature::AccountMetadataHistory) && metadata_changed {
                self.record_account_metadata_revision_in_tx(&mut tx, address, now)
                    .await?;
            }
        }
        for (address, incoming) in &plan.account_metadata {
            if involved.contains(address) {
                continue;
            }
            let metadata_changed = self
                .upsert_account_in_tx(&mut tx, address, now, Some(incoming), now)
                .await?;
            if self.feature(Feature::AccountMetadataHistory) && metadata_changed {
                self.record_account_metadata_revision_in_tx(&mut tx, address, now)
                    .await?;
            }
        }

        sqlx::query(&format!(
            "INSERT INTO {} (ledger, id, postings, timestamp, inserted_at, updated_at,
                             reference, metadata, reverted_at)
             VALUES ($1, $2, $3, $4, $5, $5, $6, $7, NULL)",
            self.table("transactions"),
        ))
        .bind(&self.ledger.name)
        .bind(id as i64)
        .bind(serde_json::to_value(&plan.postings).unwrap_or_default())
        .bind(plan.timestamp)
        .bind(now)
        .bind(&plan.reference)
        .bind(serde_json::to_value(&plan.metadata).unwrap_or_default())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let mut post_commit_volumes = PostCommitVolumes::new();
        for posting in &plan.postings {
            for (account, is_source) in [(&posting.source, true), (&posting.destination, false)] {
                let snapshot = self
                    .insert_move_in_tx(
                        &mut tx,
                        id,
                        account.as_str(),
                        &posting.asset,
                        &posting.amount,
                        is_source,
                        now,
                        plan.timestamp,
                    )
                    .await?;
                if let Some(volumes) = snapshot {
                    post_commit_volumes
                        .entry(account.as_str().to_string())
                        .or_default()
                        .insert(posting.asset.clone(), volumes);
                }
            }
        }

        if self.feature(Feature::TransactionMetadataHistory) && !plan.metadata.is_empty() {
            self.record_transaction_metadata_revision_in_tx(&mut tx, id, now)
                .await?;
        }

        if let Some(reverted_id) = plan.reverts {
            sqlx::query(&format!(
                "UPDATE {} SET reverted_at = $3, updated_at = $3 WHERE ledger = $1 AND id = $2",
                self.table("transactions"),
            ))
            .bind(&self.ledger.name)
            .bind(reverted_id as i64)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        }

        let transaction = Transaction {
            id,
            postings: plan.postings.clone(),
            timestamp: plan.timestamp,
            inserted_at: now,
            updated_at: now,
            reference: plan.reference.clone(),
            metadata: plan.metadata.clone(),
            reverted_at: None,
            post_commit_volumes: self
                .feature(Feature::MovesHistory)
                .then_some(post_commit_volumes),
        };

        // ── Phase 3: Log and advance the head ────────────────────────────
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
        let log = self
            .append_log_in_tx(&mut tx, &mut head, data, now, plan.idempotency)
            .await?;

        head.last_tx_id = id as i64;
        head.last_tx_timestamp = Some(match head.last_tx_timestamp {
            Some(previous) if previous > plan.timestamp => previous,
            _ => plan.timestamp,
        });
        self.update_head(&mut tx, &head).await?;

        tx.commit().await.map_err(map_sqlx_err)?;
        debug!(ledger = %self.ledger.name, id, "transaction committed");
        Ok(CommitOutcome { transaction, log })
    }

    pub(crate) async fn record_transaction_metadata_revision_in_tx(
        &self,
        conn: &mut PgConnection,
        id: u64,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        sqlx::query(&format!(
            "INSERT INTO {history} (ledger, transactions_id, revision, date, metadata)
             SELECT $1, $2,
                    COALESCE((SELECT MAX(revision) + 1 FROM {history}
                              WHERE ledger = $1 AND transactions_id = $2), 0),
                    $3,
                    (SELECT metadata FROM {transactions} WHERE ledger = $1 AND id = $2)",
            history = self.table("transactions_metadata"),
            transactions = self.table("transactions"),
        ))
        .bind(&self.ledger.name)
        .bind(id as i64)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    // ── Metadata mutations ───────────────────────────────────────────────

    pub(crate) async fn save_account_metadata_impl(
        &self,
        address: &AccountAddress,
        metadata: Metadata,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let mut head = self.lock_head(&mut tx).await?;

        let now = Utc::now();
        let metadata_changed = self
            .upsert_account_in_tx(&mut tx, address.as_str(), now, Some(&metadata), now)
            .await?;
        if self.feature(Feature::AccountMetadataHistory) && metadata_changed {
            self.record_account_metadata_revision_in_tx(&mut tx, address.as_str(), now)
                .await?;
        }

        let log = self
            .append_log_in_tx(
                &mut tx,
                &mut head,
                LogData::SetMetadata {
                    target_type: MetadataTarget::Account,
                    target_id: address.as_str().to_string(),
                    metadata,
                },
                now,
                idempotency,
            )
            .await?;
        self.update_head(&mut tx, &head).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(log)
    }

    pub(crate) async fn delete_account_metadata_impl(
        &self,
        address: &AccountAddress,
        key: &str,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let mut head = self.lock_head(&mut tx).await?;
        let now = Utc::now();

        let updated = sqlx::query(&format!(
            "UPDATE {} SET metadata = metadata - $3, updated_at = $4
             WHERE ledger = $1 AND address = $2 AND metadata ? $3",
            self.table("accounts"),
        ))
        .bind(&self.ledger.name)
        .bind(address.as_str())
        .bind(key)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let exists: Option<i32> = sqlx::query_scalar(&format!(
            "SELECT 1 FROM {} WHERE ledger = $1 AND address = $2",
            self.table("accounts"),
        ))
        .bind(&self.ledger.name)
        .bind(address.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        if exists.is_none() {
            return Err(LedgerError::NotFound);
        }

        if self.feature(Feature::AccountMetadataHistory) && updated.rows_affected() > 0 {
            self.record_account_metadata_revision_in_tx(&mut tx, address.as_str(), now)
                .await?;
        }

        let log = self
            .append_log_in_tx(
                &mut tx,
                &mut head,
                LogData::DeleteMetadata {
                    target_type: MetadataTarget::Account,
                    target_id: address.as_str().to_string(),
                    key: key.to_string(),
                },
                now,
                idempotency,
            )
            .await?;
        self.update_head(&mut tx, &head).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(log)
    }

    pub(crate) async fn save_transaction_metadata_impl(
        &self,
        id: u64,
        metadata: Metadata,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let mut head = self.lock_head(&mut tx).await?;
        let now = Utc::now();

        let exists: Option<i32> = sqlx::query_scalar(&format!(
            "SELECT 1 FROM {} WHERE ledger = $1 AND id = $2 FOR UPDATE",
            self.table("transactions"),
        ))
        .bind(&self.ledger.name)
        .bind(id as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        if exists.is_none() {
            return Err(LedgerError::NotFound);
        }

        let updated = sqlx::query(&format!(
            "UPDATE {} SET metadata = metadata || $3, updated_at = $4
             WHERE ledger = $1 AND id = $2 AND NOT metadata @> $3",
            self.table("transactions"),
        ))
        .bind(&self.ledger.name)
        .bind(id as i64)
        .bind(serde_json::to_value(&metadata).unwrap_or_default())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        if self.feature(Feature::TransactionMetadataHistory) && updated.rows_affected() > 0 {
            self.record_transaction_metadata_revision_in_tx(&mut tx, id, now)
                .await?;
        }

        let log = self
            .append_log_in_tx(
                &mut tx,
                &mut head,
                LogData::SetMetadata {
                    target_type: MetadataTarget::Transaction,
                    target_id: id.to_string(),
                    metadata,
                },
                now,
                idempotency,
            )
            .await?;
        self.update_head(&mut tx, &head).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(log)
    }

    pub(crate) async fn delete_transaction_metadata_impl(
        &self,
        id: u64,
        key: &str,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let mut head = self.lock_head(&mut tx).await?;
        let now = Utc::now();

        let exists: Option<i32> = sqlx::query_scalar(&format!(
            "SELECT 1 FROM {} WHERE ledger = $1 AND id = $2 FOR UPDATE",
            self.table("transactions"),
        ))
        .bind(&self.ledger.name)
        .bind(id as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        if exists.is_none() {
            return Err(LedgerError::NotFound);
        }

        let updated = sqlx::query(&format!(
            "UPDATE {} SET metadata = metadata - $3, updated_at = $4
             WHERE ledger = $1 AND id = $2 AND metadata ? $3",
            self.table("transactions"),
        ))
        .bind(&self.ledger.name)
        .bind(id as i64)
        .bind(key)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        if self.feature(Feature::TransactionMetadataHistory) && updated.rows_affected() > 0 {
            self.record_transaction_metadata_revision_in_tx(&mut tx, id, now)
                .await?;
        }

        let log = self
            .append_log_in_tx(
                &mut tx,
                &mut head,
                LogData::DeleteMetadata {
                    target_type: MetadataTarget::Transaction,
                    target_id: id.to_string(),
                    key: key.to_string(),
                },
                now,
                idempotency,
            )
            .await?;
        self.update_head(&mut tx, &head).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(log)
    }

    // ── Log replay (import) ──────────────────────────────────────────────

    pub(crate) async fn replay_log_in_tx(
        &self,
        conn: &mut PgConnection,
        head: &mut super::logs::Head,
        log: &Log,
    ) -> Result<(), LedgerError> {
        match &log.data {
            LogData::NewTransaction { transaction, .. }
            | LogData::RevertedTransaction { transaction, .. } => {
                if transaction.id as i64 != head.last_tx_id + 1 {
                    return Err(LedgerError::ImportHashMismatch(log.id));
                }
                let empty = std::collections::BTreeMap::new();
                let account_metadata = match &log.data {
                    LogData::NewTransaction {
                        account_metadata, ..
                    } => account_metadata,
                    _ => &empty,
                };

                let involved: BTreeSet<String> = transaction
                    .postings
                    .iter()
                    .flat_map(|p| {
                        [
                            p.source.as_str().to_string(),
                            p.destination.as_str().to_string(),
                        ]
                    })
                    .collect();
                for address in &involved {
                    let metadata_changed = self
                        .upsert_account_in_tx(
                            conn,
                            address,
                            transaction.timestamp,
                            account_metadata.get(address),
                            transaction.inserted_at,
                        )
                        .await?;
                    if self.feature(Feature::AccountMetadataHistory) && metadata_changed {
                        self.record_account_metadata_revision_in_tx(
                            conn,
                            address,
                            transaction.inserted_at,
                        )
                        .await?;
                    }
                }

                sqlx::query(&format!(
                    "INSERT INTO {} (ledger, id, postings, timestamp, inserted_at, updated_at,
                                     reference, metadata, reverted_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                    self.table("transactions"),
                ))
                .bind(&self.ledger.name)
                .bind(transaction.id as i64)
                .bind(serde_json::to_value(&transaction.postings).unwrap_or_default())
                .bind(transaction.timestamp)
                .bind(transaction.inserted_at)
                .bind(transaction.updated_at)
                .bind(&transaction.reference)
                .bind(serde_json::to_value(&transaction.metadata).unwrap_or_default())
                .bind(transaction.reverted_at)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_err)?;

                for posting in &transaction.postings {
                    for (account, is_source) in
                        [(&posting.source, true), (&posting.destination, false)]
                    {
                        self.insert_move_in_tx(
                            conn,
                            transaction.id,
                            account.as_str(),
                            &posting.asset,
                            &posting.amount,
                            is_source,
                            transaction.inserted_at,
                            transaction.timestamp,
                        )
                        .await?;
                    }
                }

                if let LogData::RevertedTransaction {
                    reverted_transaction_id,
                    ..
                } = &log.data
                {
                    sqlx::query(&format!(
                        "UPDATE {} SET reverted_at = $3, updated_at = $3
                         WHERE ledger = $1 AND id = $2",
                        self.table("transactions"),
                    ))
                    .bind(&self.ledger.name)
                    .bind(*reverted_transaction_id as i64)
                    .bind(log.date)
                    .execute(&mut *conn)
                    .await
                    .map_err(map_sqlx_err)?;
                }

                head.last_tx_id = transaction.id as i64;
                head.last_tx_timestamp = Some(match head.last_tx_timestamp {
                    Some(previous) if previous > transaction.timestamp => previous,
                    _ => transaction.timestamp,
                });
            }
            LogData::SetMetadata {
                target_type: MetadataTarget::Account,
                target_id,
                metadata,
            } => {
                let metadata_changed = self
                    .upsert_account_in_tx(conn, target_id, log.date, Some(metadata), log.date)
                    .await?;
                if self.feature(Feature::AccountMetadataHistory) && metadata_changed {
                    self.record_account_metadata_revision_in_tx(conn, target_id, log.date)
                        .await?;
                }
            }
            LogData::SetMetadata {
                target_type: MetadataTarget::Transaction,
                target_id,
                metadata,
            } => {
                let id: i64 = target_id
                    .parse()
                    .map_err(|_| LedgerError::ImportHashMismatch(log.id))?;
                sqlx::query(&format!(
                    "UPDATE {} SET metadata = metadata || $3, updated_at = $4
                     WHERE ledger = $1 AND id = $2",
                    self.table("transactions"),
                ))
                .bind(&self.ledger.name)
                .bind(id)
                .bind(serde_json::to_value(metadata).unwrap_or_default())
                .bind(log.date)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_err)?;
            }
            LogData::DeleteMetadata {
                target_type: MetadataTarget::Account,
                target_id,
                key,
            } => {
                sqlx::query(&format!(
                    "UPDATE {} SET metadata = metadata - $3 WHERE ledger = $1 AND address = $2",
                    self.table("accounts"),
                ))
                .bind(&self.ledger.name)
                .bind(target_id)
                .bind(key)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_err)?;
            }
            LogData::DeleteMetadata {
                target_type: MetadataTarget::Transaction,
                target_id,
                key,
            } => {
                let id: i64 = target_id
                    .parse()
                    .map_err(|_| LedgerError::ImportHashMismatch(log.id))?;
                sqlx::query(&format!(
                    "UPDATE {} SET metadata = metadata - $3 WHERE ledger = $1 AND id = $2",
                    self.table("transactions"),
                ))
                .bind(&self.ledger.name)
                .bind(id)
                .bind(key)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_err)?;
            }
        }
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────

    fn transaction_metadata_expr(&self, pit: Option<DateTime<Utc>>) -> String {
        match pit {
            Some(pit) if self.feature(Feature::TransactionMetadataHistory) => format!(
                "COALESCE((SELECT tm.metadata FROM {} tm \
                 WHERE tm.ledger = transactions.ledger AND tm.transactions_id = transactions.id \
                 AND tm.date <= '{}'::timestamptz \
                 ORDER BY tm.revision DESC LIMIT 1), '{{}}'::jsonb)",
                self.table("transactions_metadata"),
                pit.to_rfc3339_opts(SecondsFormat::Micros, true),
            ),
            _ => "transactions.metadata".to_string(),
        }
    }

    fn transactions_query(
        &self,
        options: &TransactionsQueryOptions,
        selection: &str,
    ) -> Result<QueryBuilder<'static, Postgres>, LedgerError> {
        let metadata_expr = self.transaction_metadata_expr(options.pit);
        let mut qb = QueryBuilder::new(format!(
            "SELECT {} FROM {} transactions WHERE transactions.ledger = ",
            selection,
            self.table("transactions"),
        ));
        qb.push_bind(self.ledger.name.clone());
        if let Some(pit) = options.pit {
            qb.push(" AND transactions.timestamp <= ");
            qb.push_bind(pit);
        }
        if let Some(filter) = &options.filter {
            let ctx = TransactionsSqlContext {
                metadata_expr: &metadata_expr,
            };
            qb.push(" AND ");
            push_transactions_condition(&mut qb, &ctx, filter)?;
        }
        Ok(qb)
    }

    fn transaction_selection(&self, pit: Option<DateTime<Utc>>) -> String {
        format!(
            "transactions.id, transactions.postings, {} AS metadata, transactions.timestamp, \
             transactions.inserted_at, transactions.updated_at, transactions.reference, \
             transactions.reverted_at",
            self.transaction_metadata_expr(pit),
        )
    }

    pub(crate) async fn get_transaction_impl(
        &self,
        id: u64,
        pit: Option<DateTime<Utc>>,
    ) -> Result<Option<Transaction>, LedgerError> {
        let options = TransactionsQueryOptions { pit, filter: None };
        let mut qb = self.transactions_query(&options, &self.transaction_selection(pit))?;
        qb.push(" AND transactions.id = ");
        qb.push_bind(id as i64);
        qb.push(" LIMIT 1");

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.as_ref().map(decode_transaction_row).transpose()
    }

    pub(crate) async fn list_transactions_impl(
        &self,
        options: TransactionsQueryOptions,
        page: Page,
    ) -> Result<(Vec<Transaction>, bool), LedgerError> {
        let mut qb =
            self.transactions_query(&options, &self.transaction_selection(options.pit))?;
        qb.push(" ORDER BY transactions.id DESC LIMIT ");
        qb.push_bind(page.page_size as i64 + 1);
        qb.push(" OFFSET ");
        qb.push_bind(page.offset as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        let has_more = rows.len() as u64 > page.page_size;
        let transactions = rows
            .iter()
            .take(page.page_size as usize)
            .map(decode_transaction_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((transactions, has_more))
    }

    pub(crate) async fn count_transactions_impl(
        &self,
        options: TransactionsQueryOptions,
    ) -> Result<u64, LedgerError> {
        let mut qb = self.transactions_query(&options, "COUNT(*)")?;
        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(count as u64)
    }

    pub(crate) async fn last_committed_timestamp_impl(
        &self,
    ) -> Result<Option<DateTime<Utc>>, LedgerError> {
        sqlx::query_scalar(&format!(
            "SELECT last_tx_timestamp FROM {} WHERE ledger = $1",
            self.table("logs_heads"),
        ))
        .bind(&self.ledger.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)
        .map(|row: Option<Option<DateTime<Utc>>>| row.flatten())
    }
}

fn decode_transaction_row(row: &sqlx::postgres::PgRow) -> Result<Transaction, LedgerError> {
    let id: i64 = row.try_get("id").map_err(map_sqlx_err)?;
    let postings: serde_json::Value = row.try_get("postings").map_err(map_sqlx_err)?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(map_sqlx_err)?;
    Ok(Transaction {
        id: id as u64,
        postings: serde_json::from_value(postings)
            .map_err(|err| LedgerError::Storage(err.to_string()))?,
        timestamp: row.try_get("timestamp").map_err(map_sqlx_err)?,
        inserted_at: row.try_get("inserted_at").map_err(map_sqlx_err)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_err)?,
        reference: row.try_get("reference").map_err(map_sqlx_err)?,
        metadata: serde_json::from_value(metadata)
            .map_err(|err| LedgerError::Storage(err.to_string()))?,
        reverted_at: row.try_get("reverted_at").map_err(map_sqlx_err)?,
        post_commit_volumes: None,
    })
}
