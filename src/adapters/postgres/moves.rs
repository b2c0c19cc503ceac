// src/adapters/postgres/moves.rs
use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row};

use crate::core::{Amount, Volumes};
use crate::error::LedgerError;
use crate::registry::features::Feature;

use super::{map_sqlx_err, PostgresLedgerStore};

fn decode_volumes(value: Option<serde_json::Value>) -> Result<Volumes, LedgerError> {
    match value {
        Some(value) => {
            serde_json::from_value(value).map_err(|err| LedgerError::Storage(err.to_string()))
        }
        None => Ok(Volumes::zero()),
    }
}

fn parse_amount(text: String) -> Result<Amount, LedgerError> {
    Amount::from_str(&text).map_err(|err| LedgerError::Storage(err.to_string()))
}

impl PostgresLedgerStore {
    /// Exact current balance, aggregated over the raw moves.
    pub(crate) async fn current_balance(
        &self,
        account: &str,
        asset: &str,
    ) -> Result<Amount, LedgerError> {
        let text: String = sqlx::query_scalar(&format!(
            "SELECT COALESCE(SUM(CASE WHEN is_source THEN -amount ELSE amount END), 0)::text
             FROM {} WHERE ledger = $1 AND accounts_address = $2 AND asset = $3",
            self.table("moves"),
        ))
        .bind(&self.ledger.name)
        .bind(account)
        .bind(asset)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        parse_amount(text)
    }

    /// Balances for every pair the plan touches, read inside the commit's
    /// transaction (the head lock is already held, so these are stable).
    pub(crate) async fn load_balances_in_tx(
        &self,
        conn: &mut PgConnection,
        pairs: &[(String, String)],
    ) -> Result<BTreeMap<(String, String), Amount>, LedgerError> {
        let mut balances = BTreeMap::new();
        for (account, asset) in pairs {
            let text: String = sqlx::query_scalar(&format!(
                "SELECT COALESCE(SUM(CASE WHEN is_source THEN -amount ELSE amount END), 0)::text
                 FROM {} WHERE ledger = $1 AND accounts_address = $2 AND asset = $3",
                self.table("moves"),
            ))
            .bind(&self.ledger.name)
            .bind(account)
            .bind(asset)
            .fetch_one(&mut *conn)
            .await
            .map_err(map_sqlx_err)?;
            balances.insert((account.clone(), asset.clone()), parse_amount(text)?);
        }
        Ok(balances)
    }

    /// Insert one move, computing both running snapshots. A back-dated move
    /// re-aggregates every later snapshot on the effective trail.
    /// Returns the insertion-order snapshot when moves history is on.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn insert_move_in_tx(
        &self,
        conn: &mut PgConnection,
        transaction_id: u64,
        account: &str,
        asset: &str,
        amount: &Amount,
        is_source: bool,
        insertion_date: DateTime<Utc>,
        effective_date: DateTime<Utc>,
    ) -> Result<Option<Volumes>, LedgerError> {
        let ledger = self.ledger.name.clone();

        let post_commit_volumes = if self.feature(Feature::MovesHistory) {
            let previous: Option<serde_json::Value> = sqlx::query_scalar(&format!(
                "SELECT post_commit_volumes FROM {}
                 WHERE ledger = $1 AND accounts_address = $2 AND asset = $3
                 ORDER BY seq DESC LIMIT 1",
                self.table("moves"),
            ))
            .bind(&ledger)
            .bind(account)
            .bind(asset)
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_sqlx_err)?;
            Some(decode_volumes(previous)?.apply(amount, is_source))
        } else {
            None
        };

        let seq: i64 = sqlx::query_scalar(&format!(
            "INSERT INTO {} (ledger, transactions_id, accounts_address, asset, amount,
                             is_source, insertion_date, effective_date, post_commit_volumes)
             VALUES ($1, $2, $3, $4, $5::numeric, $6, $7, $8, $9)
             RETURNING seq",
            self.table("moves"),
        ))
        .bind(&ledger)
        .bind(transaction_id as i64)
        .bind(account)
        .bind(asset)
        .bind(amount.to_string())
        .bind(is_source)
        .bind(insertion_date)
        .bind(effective_date)
        .bind(
            post_commit_volumes
                .as_ref()
                .map(|v| serde_json::to_value(v).unwrap_or_default()),
        )
        .fetch_one(&mut *conn)
        .await
        .map_err(map_sqlx_err)?;

        if self.feature(Feature::MovesHistoryPostCommitEffectiveVolumes) {
            let previous: Option<serde_json::Value> = sqlx::query_scalar(&format!(
                "SELECT post_commit_effective_volumes FROM {}
                 WHERE ledger = $1 AND accounts_address = $2 AND asset = $3
                   AND (effective_date < $4 OR (effective_date = $4 AND seq < $5))
                 ORDER BY effective_date DESC, seq DESC LIMIT 1",
                self.table("moves"),
            ))
            .bind(&ledger)
            .bind(account)
            .bind(asset)
            .bind(effective_date)
            .bind(seq)
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_sqlx_err)?;

            let mut running = decode_volumes(previous)?.apply(amount, is_source);
            sqlx::query(&format!(
                "UPDATE {} SET post_commit_effective_volumes = $2 WHERE seq = $1",
                self.table("moves"),
            ))
            .bind(seq)
            .bind(serde_json::to_value(&running).unwrap_or_default())
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_err)?;

            // out-of-order insert: everything later on the effective trail
            // is now stale
            let later = sqlx::query(&format!(
                "SELECT seq, amount::text AS amount, is_source FROM {}
                 WHERE ledger = $1 AND accounts_address = $2 AND asset = $3
                   AND (effective_date > $4 OR (effective_date = $4 AND seq > $5))
                 ORDER BY effective_date, seq",
                self.table("moves"),
            ))
            .bind(&ledger)
            .bind(account)
            .bind(asset)
            .bind(effective_date)
            .bind(seq)
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx_err)?;

            for row in later {
                let later_seq: i64 = row.try_get("seq").map_err(map_sqlx_err)?;
                let later_amount = parse_amount(row.try_get("amount").map_err(map_sqlx_err)?)?;
                let later_is_source: bool = row.try_get("is_source").map_err(map_sqlx_err)?;
                running = running.apply(&later_amount, later_is_source);
                sqlx::query(&format!(
                    "UPDATE {} SET post_commit_effective_volumes = $2 WHERE seq = $1",
                    self.table("moves"),
                ))
                .bind(later_seq)
                .bind(serde_json::to_value(&running).unwrap_or_default())
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_err)?;
            }
        }

        Ok(post_commit_volumes)
    }

    /// Assets with at least one move on the account.
    pub(crate) async fn assets_of(&self, account: &str) -> Result<Vec<String>, LedgerError> {
        sqlx::query_scalar(&format!(
            "SELECT DISTINCT asset FROM {} WHERE ledger = $1 AND accounts_address = $2
             ORDER BY asset",
            self.table("moves"),
        ))
        .bind(&self.ledger.name)
        .bind(account)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }

    /// Latest insertion-order snapshot bounded by a date on either column.
    pub(crate) async fn pcv_at(
        &self,
        account: &str,
        asset: &str,
        pit: Option<DateTime<Utc>>,
        by_insertion_date: bool,
    ) -> Result<Volumes, LedgerError> {
        let column = if by_insertion_date {
            "insertion_date"
        } else {
            "effective_date"
        };
        let mut sql = format!(
            "SELECT post_commit_volumes FROM {}
             WHERE ledger = $1 AND accounts_address = $2 AND asset = $3",
            self.table("moves"),
        );
        if pit.is_some() {
            sql.push_str(&format!(" AND {} <= $4", column));
        }
        sql.push_str(" ORDER BY seq DESC LIMIT 1");

        let mut query = sqlx::query_scalar::<_, Option<serde_json::Value>>(&sql)
            .bind(&self.ledger.name)
            .bind(account)
            .bind(asset);
        if let Some(pit) = pit {
            query = query.bind(pit);
        }
        let value = query
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?
            .flatten();
        decode_volumes(value)
    }

    /// Latest effective-order snapshot bounded by effective date.
    pub(crate) async fn pcev_at(
        &self,
        account: &str,
        asset: &str,
        pit: Option<DateTime<Utc>>,
    ) -> Result<Volumes, LedgerError> {
        let mut sql = format!(
            "SELECT post_commit_effective_volumes FROM {}
             WHERE ledger = $1 AND accounts_address = $2 AND asset = $3",
            self.table("moves"),
        );
        if pit.is_some() {
            sql.push_str(" AND effective_date <= $4");
        }
        sql.push_str(" ORDER BY effective_date DESC, seq DESC LIMIT 1");

        let mut query = sqlx::query_scalar::<_, Option<serde_json::Value>>(&sql)
            .bind(&self.ledger.name)
            .bind(account)
            .bind(asset);
        if let Some(pit) = pit {
            query = query.bind(pit);
        }
        let value = query
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?
            .flatten();
        decode_volumes(value)
    }
}
