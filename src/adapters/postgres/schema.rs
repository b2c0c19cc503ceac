// src/adapters/postgres/schema.rs
//
// One Postgres schema per bucket, plus a `_system` schema for the catalog.
// Migrations are applied in order; a bucket whose recorded version is ahead
// of this build fails BUCKET_OUTDATED.
use sqlx::PgPool;

use crate::error::LedgerError;

use super::map_sqlx_err;

pub const SYSTEM_SCHEMA: &str = "_system";

/// Ordered bucket migrations; `{schema}` is replaced with the quoted bucket
/// schema name. The recorded version is the number of applied entries.
const BUCKET_MIGRATIONS: [&str; 3] = [
    // v1: base relations
    r#"
    CREATE TABLE IF NOT EXISTS {schema}.accounts (
        ledger         TEXT NOT NULL,
        address        TEXT NOT NULL,
        address_array  TEXT[],
        metadata       JSONB NOT NULL DEFAULT '{}'::jsonb,
        first_usage    TIMESTAMPTZ NOT NULL,
        insertion_date TIMESTAMPTZ NOT NULL,
        updated_at     TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (ledger, address)
    );
    CREATE TABLE IF NOT EXISTS {schema}.transactions (
        ledger      TEXT NOT NULL,
        id          BIGINT NOT NULL,
        postings    JSONB NOT NULL,
        timestamp   TIMESTAMPTZ NOT NULL,
        inserted_at TIMESTAMPTZ NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL,
        reference   TEXT,
        metadata    JSONB NOT NULL DEFAULT '{}'::jsonb,
        reverted_at TIMESTAMPTZ,
        PRIMARY KEY (ledger, id)
    );
    CREATE TABLE IF NOT EXISTS {schema}.moves (
        seq             BIGSERIAL PRIMARY KEY,
        ledger          TEXT NOT NULL,
        transactions_id BIGINT NOT NULL,
        accounts_address TEXT NOT NULL,
        asset           TEXT NOT NULL,
        amount          NUMERIC NOT NULL,
        is_source       BOOLEAN NOT NULL,
        insertion_date  TIMESTAMPTZ NOT NULL,
        effective_date  TIMESTAMPTZ NOT NULL,
        post_commit_volumes JSONB,
        post_commit_effective_volumes JSONB
    );
    CREATE TABLE IF NOT EXISTS {schema}.logs (
        ledger           TEXT NOT NULL,
        id               BIGINT NOT NULL,
        type             TEXT NOT NULL,
        date             TIMESTAMPTZ NOT NULL,
        data             JSONB NOT NULL,
        hash             TEXT,
        idempotency_key  TEXT,
        idempotency_hash TEXT,
        PRIMARY KEY (ledger, id)
    );
    CREATE TABLE IF NOT EXISTS {schema}.accounts_metadata (
        ledger           TEXT NOT NULL,
        accounts_address TEXT NOT NULL,
        revision         BIGINT NOT NULL,
        date             TIMESTAMPTZ NOT NULL,
        metadata         JSONB NOT NULL,
        PRIMARY KEY (ledger, accounts_address, revision)
    );
    CREATE TABLE IF NOT EXISTS {schema}.transactions_metadata (
        ledger          TEXT NOT NULL,
        transactions_id BIGINT NOT NULL,
        revision        BIGINT NOT NULL,
        date            TIMESTAMPTZ NOT NULL,
        metadata        JSONB NOT NULL,
        PRIMARY KEY (ledger, transactions_id, revision)
    );
    "#,
    // v2: indexes and uniqueness
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS transactions_reference_unique
        ON {schema}.transactions (ledger, reference) WHERE reference IS NOT NULL;
    CREATE UNIQUE INDEX IF NOT EXISTS logs_idempotency_key_unique
        ON {schema}.logs (ledger, idempotency_key) WHERE idempotency_key IS NOT NULL;
    CREATE INDEX IF NOT EXISTS moves_by_effective_date
        ON {schema}.moves (ledger, accounts_address, asset, effective_date);
    CREATE INDEX IF NOT EXISTS moves_by_seq
        ON {schema}.moves (ledger, accounts_address, asset, seq);
    CREATE INDEX IF NOT EXISTS accounts_metadata_gin
        ON {schema}.accounts USING GIN (metadata jsonb_path_ops);
    "#,
    // v3: per-ledger head row serializing commits
    r#"
    CREATE TABLE IF NOT EXISTS {schema}.logs_heads (
        ledger            TEXT PRIMARY KEY,
        last_log_id       BIGINT NOT NULL DEFAULT -1,
        last_log_hash     TEXT,
        last_tx_id        BIGINT NOT NULL DEFAULT -1,
        last_tx_timestamp TIMESTAMPTZ
    );
    CREATE INDEX IF NOT EXISTS accounts_address_array_gin
        ON {schema}.accounts USING GIN (address_array);
    "#,
];

pub fn supported_bucket_version() -> i64 {
    BUCKET_MIGRATIONS.len() as i64
}

fn quoted(bucket: &str) -> String {
    format!("\"{}\"", bucket)
}

pub async fn ensure_system_schema(pool: &PgPool) -> Result<(), LedgerError> {
    let statements = format!(
        r#"
        CREATE SCHEMA IF NOT EXISTS {system};
        CREATE TABLE IF NOT EXISTS {system}.ledgers (
            name     TEXT PRIMARY KEY,
            bucket   TEXT NOT NULL,
            features JSONB NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
            state    TEXT NOT NULL,
            added_at TIMESTAMPTZ NOT NULL
        );
        CREATE TABLE IF NOT EXISTS {system}.schema_versions (
            bucket  TEXT PRIMARY KEY,
            version BIGINT NOT NULL
        );
        "#,
        system = quoted(SYSTEM_SCHEMA),
    );
    sqlx::raw_sql(&statements)
        .execute(pool)
        .await
        .map_err(map_sqlx_err)?;
    Ok(())
}

pub async fn bucket_version(pool: &PgPool, bucket: &str) -> Result<i64, LedgerError> {
    let version: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT version FROM {}.schema_versions WHERE bucket = $1",
        quoted(SYSTEM_SCHEMA),
    ))
    .bind(bucket)
    .fetch_optional(pool)
    .await
    .map_err(map_sqlx_err)?;
    Ok(version.unwrap_or(0))
}

/// Apply outstanding migrations to the bucket schema.
pub async fn migrate_bucket(pool: &PgPool, bucket: &str) -> Result<(), LedgerError> {
    ensure_system_schema(pool).await?;

    let current = bucket_version(pool, bucket).await?;
    let supported = supported_bucket_version();
    if current > supported {
        return Err(LedgerError::BucketOutdated(bucket.to_string()));
    }
    if current == supported {
        return Ok(());
    }

    sqlx::raw_sql(&format!("CREATE SCHEMA IF NOT EXISTS {}", quoted(bucket)))
        .execute(pool)
        .await
        .map_err(map_sqlx_err)?;

    for migration in BUCKET_MIGRATIONS.iter().skip(current as usize) {
        let statements = migration.replace("{schema}", &quoted(bucket));
        sqlx::raw_sql(&statements)
            .execute(pool)
            .await
            .map_err(map_sqlx_err)?;
    }

    sqlx::query(&format!(
        "INSERT INTO {}.schema_versions (bucket, version) VALUES ($1, $2)
         ON CONFLICT (bucket) DO UPDATE SET version = excluded.version",
        quoted(SYSTEM_SCHEMA),
    ))
    .bind(bucket)
    .bind(supported)
    .execute(pool)
    .await
    .map_err(map_sqlx_err)?;

    Ok(())
}
