// src/adapters/postgres/filter.rs
//
// Compile the filter DSL to SQL. Key validation already happened in the
// query controller; this layer only shapes conditions and binds values.
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};

use crate::error::LedgerError;
use crate::query::filter::{parse_key, value_to_amount, Filter, FilterKey, Operator};

/// Convert a segment-anchored address pattern into a Postgres regex.
pub(crate) fn address_to_pg_regex(pattern: &str) -> String {
    let mut segments: Vec<&str> = pattern.split('/').collect();
    let prefix = segments.len() > 1 && segments.last() == Some(&"");
    if prefix {
        segments.pop();
    }
    let body = segments
        .iter()
        .map(|segment| {
            if segment.is_empty() {
                "[^/]+".to_string()
            } else {
                (*segment).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/");
    if prefix {
        format!("^{}(/[^/]+)*$", body)
    } else {
        format!("^{}$", body)
    }
}

fn sql_op(operator: Operator) -> Result<&'static str, LedgerError> {
    Ok(match operator {
        Operator::Match => "=",
        Operator::Lt => "<",
        Operator::Lte => "<=",
        Operator::Gt => ">",
        Operator::Gte => ">=",
        Operator::Exists => {
            return Err(LedgerError::InvalidQuery(
                "$exists is not a comparison".to_string(),
            ))
        }
    })
}

fn expect_str<'a>(value: &'a Value, what: &str) -> Result<&'a str, LedgerError> {
    value
        .as_str()
        .ok_or_else(|| LedgerError::InvalidQuery(format!("{} expects a string", what)))
}

pub(crate) struct AccountsSqlContext<'a> {
    pub ledger: &'a str,
    pub moves_table: &'a str,
    /// SQL expression yielding the account's metadata (live column or the
    /// PIT history subquery).
    pub metadata_expr: &'a str,
    pub pit: Option<DateTime<Utc>>,
}

pub(crate) fn push_accounts_condition(
    qb: &mut QueryBuilder<'_, Postgres>,
    ctx: &AccountsSqlContext<'_>,
    filter: &Filter,
) -> Result<(), LedgerError> {
    match filter {
        Filter::And(children) | Filter::Or(children) => {
            let glue = if matches!(filter, Filter::And(_)) {
                " AND "
            } else {
                " OR "
            };
            if children.is_empty() {
                qb.push("TRUE");
                return Ok(());
            }
            qb.push("(");
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    qb.push(glue);
                }
                push_accounts_condition(qb, ctx, child)?;
            }
            qb.push(")");
            Ok(())
        }
        Filter::Not(child) => {
            qb.push("NOT (");
            push_accounts_condition(qb, ctx, child)?;
            qb.push(")");
            Ok(())
        }
        Filter::Leaf {
            operator,
            key,
            value,
        } => match parse_key(key) {
            FilterKey::Plain("address") => {
                let regex = address_to_pg_regex(expect_str(value, "address")?);
                qb.push("accounts.address ~ ");
                qb.push_bind(regex);
                Ok(())
            }
            FilterKey::Plain("metadata") => {
                let metadata_key = expect_str(value, "$exists")?.to_string();
                qb.push(format!("jsonb_exists({}, ", ctx.metadata_expr));
                qb.push_bind(metadata_key);
                qb.push(")");
                Ok(())
            }
            FilterKey::Indexed {
                base: "metadata",
                arg,
            } => {
                qb.push(format!("{} @> ", ctx.metadata_expr));
                qb.push_bind(serde_json::json!({ arg: value }));
                Ok(())
            }
            FilterKey::Indexed {
                base: "balance",
                arg,
            } => {
                let amount = value_to_amount(value)?;
                push_balance_subquery(qb, ctx, Some(arg));
                qb.push(format!(" {} ", sql_op(*operator)?));
                qb.push_bind(amount.to_string());
                qb.push("::numeric");
                Ok(())
            }
            FilterKey::Plain("balance") => {
                let amount = value_to_amount(value)?;
                qb.push(format!(
                    "EXISTS (SELECT 1 FROM (SELECT DISTINCT ON (m.asset) \
                     (m.post_commit_volumes->>'input')::numeric - \
                     (m.post_commit_volumes->>'output')::numeric AS balance \
                     FROM {} m WHERE m.ledger = ",
                    ctx.moves_table,
                ));
                qb.push_bind(ctx.ledger.to_string());
                qb.push(" AND m.accounts_address = accounts.address");
                if let Some(pit) = ctx.pit {
                    qb.push(" AND m.effective_date <= ");
                    qb.push_bind(pit);
                }
                qb.push(" ORDER BY m.asset, m.seq DESC) b WHERE b.balance ");
                qb.push(sql_op(*operator)?);
                qb.push(" ");
                qb.push_bind(amount.to_string());
                qb.push("::numeric)");
                Ok(())
            }
            _ => Err(LedgerError::InvalidQuery(format!("unknown key '{}'", key))),
        },
    }
}

/// Latest insertion-order balance for one (account, asset), bounded by PIT
/// on effective dates.
fn push_balance_subquery(
    qb: &mut QueryBuilder<'_, Postgres>,
    ctx: &AccountsSqlContext<'_>,
    asset: Option<&str>,
) {
    qb.push(format!(
        "COALESCE((SELECT (m.post_commit_volumes->>'input')::numeric - \
         (m.post_commit_volumes->>'output')::numeric \
         FROM {} m WHERE m.ledger = ",
        ctx.moves_table,
    ));
    qb.push_bind(ctx.ledger.to_string());
    qb.push(" AND m.accounts_address = accounts.address");
    if let Some(asset) = asset {
        qb.push(" AND m.asset = ");
        qb.push_bind(asset.to_string());
    }
    if let Some(pit) = ctx.pit {
        qb.push(" AND m.effective_date <= ");
        qb.push_bind(pit);
    }
    qb.push(" ORDER BY m.seq DESC LIMIT 1), 0)");
}

pub(crate) struct TransactionsSqlContext<'a> {
    /// SQL expression yielding the transaction's metadata.
    pub metadata_expr: &'a str,
}

pub(crate) fn push_transactions_condition(
    qb: &mut QueryBuilder<'_, Postgres>,
    ctx: &TransactionsSqlContext<'_>,
    filter: &Filter,
) -> Result<(), LedgerError> {
    match filter {
        Filter::And(children) | Filter::Or(children) => {
            let glue = if matches!(filter, Filter::And(_)) {
                " AND "
            } else {
                " OR "
            };
            if children.is_empty() {
                qb.push("TRUE");
                return Ok(());
            }
            qb.push("(");
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    qb.push(glue);
                }
                push_transactions_condition(qb, ctx, child)?;
            }
            qb.push(")");
            Ok(())
        }
        Filter::Not(child) => {
            qb.push("NOT (");
            push_transactions_condition(qb, ctx, child)?;
            qb.push(")");
            Ok(())
        }
        Filter::Leaf {
            operator,
            key,
            value,
        } => match parse_key(key) {
            FilterKey::Plain("id") => {
                let id = value_to_amount(value)?;
                qb.push(format!("transactions.id {} ", sql_op(*operator)?));
                qb.push_bind(id.to_string());
                qb.push("::numeric");
                Ok(())
            }
            FilterKey::Plain("reference") => {
                qb.push("transactions.reference = ");
                qb.push_bind(expect_str(value, "reference")?.to_string());
                Ok(())
            }
            FilterKey::Plain("timestamp") => {
                let bound = DateTime::parse_from_rfc3339(expect_str(value, "timestamp")?)
                    .map_err(|err| {
                        LedgerError::InvalidQuery(format!("bad timestamp: {}", err))
                    })?
                    .with_timezone(&Utc);
                qb.push(format!("transactions.timestamp {} ", sql_op(*operator)?));
                qb.push_bind(bound);
                Ok(())
            }
            FilterKey::Plain("reverted") => {
                let reverted = value.as_bool().ok_or_else(|| {
                    LedgerError::InvalidQuery("reverted expects a boolean".to_string())
                })?;
                qb.push("(transactions.reverted_at IS NOT NULL) = ");
                qb.push_bind(reverted);
                Ok(())
            }
            FilterKey::Plain(direction @ ("account" | "source" | "destination")) => {
                let regex = address_to_pg_regex(expect_str(value, direction)?);
                qb.push(
                    "EXISTS (SELECT 1 FROM jsonb_array_elements(transactions.postings) p WHERE ",
                );
                match direction {
                    "source" => {
                        qb.push("(p->>'source') ~ ");
                        qb.push_bind(regex);
                    }
                    "destination" => {
                        qb.push("(p->>'destination') ~ ");
                        qb.push_bind(regex);
                    }
                    _ => {
                        qb.push("(p->>'source') ~ ");
                        qb.push_bind(regex.clone());
                        qb.push(" OR (p->>'destination') ~ ");
                        qb.push_bind(regex);
                    }
                }
                qb.push(")");
                Ok(())
            }
            FilterKey::Plain("metadata") => {
                let metadata_key = expect_str(value, "$exists")?.to_string();
                qb.push(format!("jsonb_exists({}, ", ctx.metadata_expr));
                qb.push_bind(metadata_key);
                qb.push(")");
                Ok(())
            }
            FilterKey::Indexed {
                base: "metadata",
                arg,
            } => {
                qb.push(format!("{} @> ", ctx.metadata_expr));
                qb.push_bind(serde_json::json!({ arg: value }));
                Ok(())
            }
            _ => Err(LedgerError::InvalidQuery(format!("unknown key '{}'", key))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_regexes() {
        assert_eq!(address_to_pg_regex("users/1234"), "^users/1234$");
        assert_eq!(address_to_pg_regex("users/"), "^users(/[^/]+)*$");
        assert_eq!(address_to_pg_regex("/1234"), "^[^/]+/1234$");
        assert_eq!(address_to_pg_regex("world"), "^world$");
    }
}
