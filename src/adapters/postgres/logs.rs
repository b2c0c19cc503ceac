// src/adapters/postgres/logs.rs
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};

use crate::adapters::LogsQueryOptions;
use crate::core::{verify_chain, Log, LogData};
use crate::engine::plan::IdempotencyInfo;
use crate::error::LedgerError;
use crate::query::cursor::Page;
use crate::registry::features::Feature;

use super::{map_sqlx_err, PostgresLedgerStore};

/// Per-ledger head row. Locking it serializes commits and log appends for
/// one ledger, which keeps transaction ids and log ids dense and the hash
/// chain linear.
pub(crate) struct Head {
    pub last_log_id: i64,
    pub last_log_hash: Option<String>,
    pub last_tx_id: i64,
    pub last_tx_timestamp: Option<DateTime<Utc>>,
}

impl PostgresLedgerStore {
    pub(crate) async fn lock_head(&self, conn: &mut PgConnection) -> Result<Head, LedgerError> {
        sqlx::query(&format!(
            "INSERT INTO {} (ledger) VALUES ($1) ON CONFLICT (ledger) DO NOTHING",
            self.table("logs_heads"),
        ))
        .bind(&self.ledger.name)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_err)?;

        let row = sqlx::query(&format!(
            "SELECT last_log_id, last_log_hash, last_tx_id, last_tx_timestamp
             FROM {} WHERE ledger = $1 FOR UPDATE",
            self.table("logs_heads"),
        ))
        .bind(&self.ledger.name)
        .fetch_one(&mut *conn)
        .await
        .map_err(map_sqlx_err)?;

        Ok(Head {
            last_log_id: row.try_get("last_log_id").map_err(map_sqlx_err)?,
            last_log_hash: row.try_get("last_log_hash").map_err(map_sqlx_err)?,
            last_tx_id: row.try_get("last_tx_id").map_err(map_sqlx_err)?,
            last_tx_timestamp: row.try_get("last_tx_timestamp").map_err(map_sqlx_err)?,
        })
    }

    /// Append one entry under the head lock; advances the head in memory.
    pub(crate) async fn append_log_in_tx(
        &self,
        conn: &mut PgConnection,
        head: &mut Head,
        data: LogData,
        now: DateTime<Utc>,
        idempotency: Option<IdempotencyInfo>,
    ) -> Result<Log, LedgerError> {
        let id = (head.last_log_id + 1) as u64;
        let mut log = Log::new(id, now, data);
        if self.feature(Feature::HashLogs) {
            log = log.chained_after(head.last_log_hash.as_deref());
        }
        if let Some(info) = idempotency {
            log.idempotency_key = Some(info.key);
            log.idempotency_hash = Some(info.hash);
        }

        self.insert_log_row(conn, &log).await?;

        head.last_log_id = log.id as i64;
        head.last_log_hash = log.hash.clone();
        Ok(log)
    }

    async fn insert_log_row(
        &self,
        conn: &mut PgConnection,
        log: &Log,
    ) -> Result<(), LedgerError> {
        sqlx::query(&format!(
            "INSERT INTO {} (ledger, id, type, date, data, hash, idempotency_key, idempotency_hash)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.table("logs"),
        ))
        .bind(&self.ledger.name)
        .bind(log.id as i64)
        .bind(log_type_str(log))
        .bind(log.date)
        .bind(serde_json::to_value(&log.data).unwrap_or_default())
        .bind(&log.hash)
        .bind(&log.idempotency_key)
        .bind(&log.idempotency_hash)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    pub(crate) async fn update_head(
        &self,
        conn: &mut PgConnection,
        head: &Head,
    ) -> Result<(), LedgerError> {
        sqlx::query(&format!(
            "UPDATE {} SET last_log_id = $2, last_log_hash = $3,
                           last_tx_id = $4, last_tx_timestamp = $5
             WHERE ledger = $1",
            self.table("logs_heads"),
        ))
        .bind(&self.ledger.name)
        .bind(head.last_log_id)
        .bind(&head.last_log_hash)
        .bind(head.last_tx_id)
        .bind(head.last_tx_timestamp)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    pub(crate) async fn list_logs_impl(
        &self,
        options: LogsQueryOptions,
        page: Page,
    ) -> Result<(Vec<Log>, bool), LedgerError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT id, type, date, data, hash, idempotency_key, idempotency_hash
             FROM {} WHERE ledger = ",
            self.table("logs"),
        ));
        qb.push_bind(self.ledger.name.clone());
        if let Some(start) = options.start_time {
            qb.push(" AND date >= ");
            qb.push_bind(start);
        }
        if let Some(end) = options.end_time {
            qb.push(" AND date < ");
            qb.push_bind(end);
        }
        if let Some(after) = options.after_id {
            qb.push(" AND id < ");
            qb.push_bind(after as i64);
        }
        qb.push(" ORDER BY id DESC LIMIT ");
        qb.push_bind(page.page_size as i64 + 1);
        qb.push(" OFFSET ");
        qb.push_bind(page.offset as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        let has_more = rows.len() as u64 > page.page_size;
        let logs = rows
            .iter()
            .take(page.page_size as usize)
            .map(decode_log_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((logs, has_more))
    }

    pub(crate) async fn last_log_impl(&self) -> Result<Option<Log>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT id, type, date, data, hash, idempotency_key, idempotency_hash
             FROM {} WHERE ledger = $1 ORDER BY id DESC LIMIT 1",
            self.table("logs"),
        ))
        .bind(&self.ledger.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.as_ref().map(decode_log_row).transpose()
    }

    pub(crate) async fn log_by_idempotency_key_impl(
        &self,
        key: &str,
    ) -> Result<Option<Log>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT id, type, date, data, hash, idempotency_key, idempotency_hash
             FROM {} WHERE ledger = $1 AND idempotency_key = $2",
            self.table("logs"),
        ))
        .bind(&self.ledger.name)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.as_ref().map(decode_log_row).transpose()
    }

    pub(crate) async fn read_logs_impl(&self) -> Result<Vec<Log>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT id, type, date, data, hash, idempotency_key, idempotency_hash
             FROM {} WHERE ledger = $1 ORDER BY id",
            self.table("logs"),
        ))
        .bind(&self.ledger.name)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.iter().map(decode_log_row).collect()
    }

    /// Replay an exported stream. The chain must connect to this ledger's
    /// head; entries are re-applied through the regular write paths.
    pub(crate) async fn import_logs_impl(&self, logs: Vec<Log>) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let mut head = self.lock_head(&mut tx).await?;

        verify_chain(
            &logs,
            (head.last_log_id + 1) as u64,
            head.last_log_hash.clone(),
        )?;

        for log in logs {
            self.replay_log_in_tx(&mut tx, &mut head, &log).await?;
            self.insert_log_row(&mut tx, &log).await?;
            head.last_log_id = log.id as i64;
            head.last_log_hash = log.hash.clone();
        }

        self.update_head(&mut tx, &head).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(())
    }
}

fn log_type_str(log: &Log) -> String {
    serde_json::to_value(log.log_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn decode_log_row(row: &sqlx::postgres::PgRow) -> Result<Log, LedgerError> {
    let id: i64 = row.try_get("id").map_err(map_sqlx_err)?;
    let log_type: String = row.try_get("type").map_err(map_sqlx_err)?;
    let data: serde_json::Value = row.try_get("data").map_err(map_sqlx_err)?;
    Ok(Log {
        id: id as u64,
        log_type: serde_json::from_value(serde_json::Value::String(log_type))
            .map_err(|err| LedgerError::Storage(err.to_string()))?,
        date: row.try_get("date").map_err(map_sqlx_err)?,
        data: serde_json::from_value(data)
            .map_err(|err| LedgerError::Storage(err.to_string()))?,
        hash: row.try_get("hash").map_err(map_sqlx_err)?,
        idempotency_key: row.try_get("idempotency_key").map_err(map_sqlx_err)?,
        idempotency_hash: row.try_get("idempotency_hash").map_err(map_sqlx_err)?,
    })
}
