// src/adapters/postgres/accounts.rs
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};

use crate::adapters::{
    AccountsQueryOptions, AggregatedBalancesQuery, GetAccountQuery, VolumesQueryOptions,
    VolumesWithBalance,
};
use crate::core::{
    aggregate_volumes, Account, AccountAddress, Amount, Metadata, Volumes, VolumesByAsset,
};
use crate::error::LedgerError;
use crate::query::cursor::Page;
use crate::registry::features::Feature;

use super::filter::{push_accounts_condition, AccountsSqlContext};
use super::{map_sqlx_err, PostgresLedgerStore};

fn segments(address: &str) -> Vec<String> {
    address.split('/').map(str::to_string).collect()
}

impl PostgresLedgerStore {
    /// Upsert one account row under the enclosing commit transaction.
    ///
    /// When nothing actually changes, the write is rolled back to a savepoint
    /// so the row lock is released immediately — hot accounts (`world`) would
    /// otherwise chain every concurrent commit behind the first one.
    /// Returns whether the stored metadata changed.
    pub(crate) async fn upsert_account_in_tx(
        &self,
        conn: &mut PgConnection,
        address: &str,
        first_usage: DateTime<Utc>,
        incoming_metadata: Option<&Metadata>,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let incoming = incoming_metadata.cloned().unwrap_or_default();
        let metadata_changed: bool = sqlx::query_scalar(&format!(
            "SELECT NOT metadata @> $3 FROM {} WHERE ledger = $1 AND address = $2",
            self.table("accounts"),
        ))
        .bind(&self.ledger.name)
        .bind(address)
        .bind(serde_json::to_value(&incoming).unwrap_or_default())
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_err)?
        .unwrap_or(!incoming.is_empty());

        sqlx::query("SAVEPOINT account_upsert")
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_err)?;

        let address_array = self
            .feature(Feature::IndexAddressSegments)
            .then(|| segments(address));

        let upserted = sqlx::query(&format!(
            "INSERT INTO {} (ledger, address, address_array, metadata, first_usage,
                             insertion_date, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $6)
             ON CONFLICT (ledger, address) DO UPDATE SET
                 first_usage = LEAST(accounts.first_usage, excluded.first_usage),
                 metadata = accounts.metadata || excluded.metadata,
                 updated_at = excluded.updated_at
             WHERE accounts.first_usage > excluded.first_usage
                OR NOT accounts.metadata @> excluded.metadata",
            self.table("accounts"),
        ))
        .bind(&self.ledger.name)
        .bind(address)
        .bind(address_array)
        .bind(serde_json::to_value(&incoming).unwrap_or_default())
        .bind(first_usage)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_err)?;

        if upserted.rows_affected() == 0 {
            // no data changed: release the row lock right away
            sqlx::query("ROLLBACK TO SAVEPOINT account_upsert")
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_err)?;
        } else {
            sqlx::query("RELEASE SAVEPOINT account_upsert")
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_err)?;
        }

        Ok(metadata_changed && upserted.rows_affected() > 0)
    }

    pub(crate) async fn record_account_metadata_revision_in_tx(
        &self,
        conn: &mut PgConnection,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        sqlx::query(&format!(
            "INSERT INTO {history} (ledger, accounts_address, revision, date, metadata)
             SELECT $1, $2,
                    COALESCE((SELECT MAX(revision) + 1 FROM {history}
                              WHERE ledger = $1 AND accounts_address = $2), 0),
                    $3,
                    (SELECT metadata FROM {accounts} WHERE ledger = $1 AND address = $2)",
            history = self.table("accounts_metadata"),
            accounts = self.table("accounts"),
        ))
        .bind(&self.ledger.name)
        .bind(address)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// The SQL expression yielding account metadata for a query: the live
    /// column, or the latest history revision at the PIT.
    fn metadata_expr(&self, pit: Option<DateTime<Utc>>) -> String {
        match pit {
            Some(pit) if self.feature(Feature::AccountMetadataHistory) => format!(
                "COALESCE((SELECT am.metadata FROM {} am \
                 WHERE am.ledger = accounts.ledger AND am.accounts_address = accounts.address \
                 AND am.date <= '{}'::timestamptz \
                 ORDER BY am.revision DESC LIMIT 1), '{{}}'::jsonb)",
                self.table("accounts_metadata"),
                pit.to_rfc3339_opts(SecondsFormat::Micros, true),
            ),
            _ => "accounts.metadata".to_string(),
        }
    }

    /// Push `SELECT {selection} FROM accounts WHERE ...` (ledger, PIT and
    /// filter conditions) into the builder. Composable as a subquery.
    fn push_accounts_query(
        &self,
        qb: &mut QueryBuilder<'static, Postgres>,
        options: &AccountsQueryOptions,
        selection: &str,
    ) -> Result<(), LedgerError> {
        let metadata_expr = self.metadata_expr(options.pit);
        let moves_table = self.table("moves");
        qb.push(format!(
            "SELECT {} FROM {} accounts WHERE accounts.ledger = ",
            selection,
            self.table("accounts"),
        ));
        qb.push_bind(self.ledger.name.clone());
        if let Some(pit) = options.pit {
            qb.push(" AND accounts.first_usage <= ");
            qb.push_bind(pit);
        }
        if let Some(filter) = &options.filter {
            let ctx = AccountsSqlContext {
                ledger: &self.ledger.name,
                moves_table: &moves_table,
                metadata_expr: &metadata_expr,
                pit: options.pit,
            };
            qb.push(" AND ");
            push_accounts_condition(qb, &ctx, filter)?;
        }
        Ok(())
    }

    fn accounts_query(
        &self,
        options: &AccountsQueryOptions,
        selection: &str,
    ) -> Result<QueryBuilder<'static, Postgres>, LedgerError> {
        let mut qb = QueryBuilder::new("");
        self.push_accounts_query(&mut qb, options, selection)?;
        Ok(qb)
    }

    async fn expand_account(
        &self,
        mut account: Account,
        options: &AccountsQueryOptions,
    ) -> Result<Account, LedgerError> {
        if options.expand_volumes {
            let mut volumes = VolumesByAsset::new();
            for asset in self.assets_of(account.address.as_str()).await? {
                volumes.insert(
                    asset.clone(),
                    self.pcv_at(account.address.as_str(), &asset, options.pit, false)
                        .await?,
                );
            }
            account.volumes = Some(volumes);
        }
        if options.expand_effective_volumes {
            let mut volumes = VolumesByAsset::new();
            for asset in self.assets_of(account.address.as_str()).await? {
                volumes.insert(
                    asset.clone(),
                    self.pcev_at(account.address.as_str(), &asset, options.pit)
                        .await?,
                );
            }
            account.effective_volumes = Some(volumes);
        }
        Ok(account)
    }

    pub(crate) async fn get_account_impl(
        &self,
        query: GetAccountQuery,
    ) -> Result<Option<Account>, LedgerError> {
        let options = AccountsQueryOptions {
            pit: query.pit,
            expand_volumes: query.expand_volumes,
            expand_effective_volumes: query.expand_effective_volumes,
            filter: None,
        };
        let metadata_expr = self.metadata_expr(query.pit);
        let selection = format!(
            "accounts.address, {} AS metadata, accounts.first_usage, \
             accounts.insertion_date, accounts.updated_at",
            metadata_expr,
        );
        let mut qb = self.accounts_query(&options, &selection)?;
        qb.push(" AND accounts.address = ");
        qb.push_bind(query.address.as_str().to_string());
        qb.push(" LIMIT 1");

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        let account = match row {
            Some(row) => decode_account_row(&row)?,
            None => return Ok(None),
        };
        Ok(Some(self.expand_account(account, &options).await?))
    }

    pub(crate) async fn list_accounts_impl(
        &self,
        options: AccountsQueryOptions,
        page: Page,
    ) -> Result<(Vec<Account>, bool), LedgerError> {
        let metadata_expr = self.metadata_expr(options.pit);
        let selection = format!(
            "accounts.address, {} AS metadata, accounts.first_usage, \
             accounts.insertion_date, accounts.updated_at",
            metadata_expr,
        );
        let mut qb = self.accounts_query(&options, &selection)?;
        qb.push(" ORDER BY accounts.address LIMIT ");
        qb.push_bind(page.page_size as i64 + 1);
        qb.push(" OFFSET ");
        qb.push_bind(page.offset as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        let has_more = rows.len() as u64 > page.page_size;

        let mut accounts = Vec::new();
        for row in rows.iter().take(page.page_size as usize) {
            let account = decode_account_row(row)?;
            accounts.push(self.expand_account(account, &options).await?);
        }
        Ok((accounts, has_more))
    }

    pub(crate) async fn count_accounts_impl(
        &self,
        options: AccountsQueryOptions,
    ) -> Result<u64, LedgerError> {
        let mut qb = self.accounts_query(&options, "COUNT(*)")?;
        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(count as u64)
    }

    pub(crate) async fn aggregated_balances_impl(
        &self,
        query: AggregatedBalancesQuery,
    ) -> Result<VolumesByAsset, LedgerError> {
        let date_column = if query.use_insertion_date {
            "insertion_date"
        } else {
            "effective_date"
        };
        let mut qb = QueryBuilder::new(format!(
            "SELECT m.asset, \
             SUM(CASE WHEN m.is_source THEN 0 ELSE m.amount END)::text AS input, \
             SUM(CASE WHEN m.is_source THEN m.amount ELSE 0 END)::text AS output \
             FROM {} m WHERE m.ledger = ",
            self.table("moves"),
        ));
        qb.push_bind(self.ledger.name.clone());
        if let Some(pit) = query.pit {
            qb.push(format!(" AND m.{} <= ", date_column));
            qb.push_bind(pit);
        }
        if let Some(filter) = &query.filter {
            let options = AccountsQueryOptions {
                pit: query.pit,
                filter: Some(filter.clone()),
                ..Default::default()
            };
            qb.push(" AND m.accounts_address IN (");
            self.push_accounts_query(&mut qb, &options, "accounts.address")?;
            qb.push(")");
        }
        qb.push(" GROUP BY m.asset ORDER BY m.asset");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        let mut out = VolumesByAsset::new();
        for row in rows {
            let asset: String = row.try_get("asset").map_err(map_sqlx_err)?;
            let volumes = decode_volume_sums(&row)?;
            aggregate_volumes(&mut out, &asset, &volumes);
        }
        Ok(out)
    }

    pub(crate) async fn volumes_with_balances_impl(
        &self,
        options: VolumesQueryOptions,
        page: Page,
    ) -> Result<(Vec<VolumesWithBalance>, bool), LedgerError> {
        let date_column = if options.use_insertion_date {
            "insertion_date"
        } else {
            "effective_date"
        };
        let group_expr = match options.group_by {
            Some(depth) => format!(
                "array_to_string((string_to_array(m.accounts_address, '/'))[1:{}], '/')",
                depth.max(1),
            ),
            None => "m.accounts_address".to_string(),
        };

        let mut qb = QueryBuilder::new(format!(
            "SELECT {} AS account, m.asset, \
             SUM(CASE WHEN m.is_source THEN 0 ELSE m.amount END)::text AS input, \
             SUM(CASE WHEN m.is_source THEN m.amount ELSE 0 END)::text AS output \
             FROM {} m WHERE m.ledger = ",
            group_expr,
            self.table("moves"),
        ));
        qb.push_bind(self.ledger.name.clone());
        if let Some(pit) = options.pit {
            qb.push(format!(" AND m.{} <= ", date_column));
            qb.push_bind(pit);
        }
        if let Some(filter) = &options.filter {
            let inner_options = AccountsQueryOptions {
                pit: options.pit,
                filter: Some(filter.clone()),
                ..Default::default()
            };
            qb.push(" AND m.accounts_address IN (");
            self.push_accounts_query(&mut qb, &inner_options, "accounts.address")?;
            qb.push(")");
        }
        qb.push(" GROUP BY 1, m.asset ORDER BY 1, m.asset LIMIT ");
        qb.push_bind(page.page_size as i64 + 1);
        qb.push(" OFFSET ");
        qb.push_bind(page.offset as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        let has_more = rows.len() as u64 > page.page_size;
        let mut out = Vec::new();
        for row in rows.iter().take(page.page_size as usize) {
            let volumes = decode_volume_sums(row)?;
            out.push(VolumesWithBalance {
                account: row.try_get("account").map_err(map_sqlx_err)?,
                asset: row.try_get("asset").map_err(map_sqlx_err)?,
                balance: volumes.balance(),
                input: volumes.input,
                output: volumes.output,
            });
        }
        Ok((out, has_more))
    }
}

fn decode_account_row(row: &sqlx::postgres::PgRow) -> Result<Account, LedgerError> {
    let address: String = row.try_get("address").map_err(map_sqlx_err)?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(map_sqlx_err)?;
    Ok(Account {
        address: AccountAddress::new(address)?,
        metadata: serde_json::from_value(metadata)
            .map_err(|err| LedgerError::Storage(err.to_string()))?,
        first_usage: row.try_get("first_usage").map_err(map_sqlx_err)?,
        insertion_date: row.try_get("insertion_date").map_err(map_sqlx_err)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_err)?,
        volumes: None,
        effective_volumes: None,
    })
}

fn decode_volume_sums(row: &sqlx::postgres::PgRow) -> Result<Volumes, LedgerError> {
    let input: String = row.try_get("input").map_err(map_sqlx_err)?;
    let output: String = row.try_get("output").map_err(map_sqlx_err)?;
    Ok(Volumes {
        input: Amount::from_str(&input).map_err(|err| LedgerError::Storage(err.to_string()))?,
        output: Amount::from_str(&output).map_err(|err| LedgerError::Storage(err.to_string()))?,
    })
}
