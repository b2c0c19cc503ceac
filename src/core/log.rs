// src/core/log.rs
use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::core::metadata::Metadata;
use crate::core::transaction::Transaction;
use crate::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    NewTransaction,
    SetMetadata,
    DeleteMetadata,
    RevertedTransaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataTarget {
    Account,
    Transaction,
}

/// Type-specific log payload. Serialized untagged; the entry's `type` field
/// carries the discriminant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogData {
    RevertedTransaction {
        reverted_transaction_id: u64,
        transaction: Transaction,
    },
    NewTransaction {
        transaction: Transaction,
        #[serde(default)]
        account_metadata: BTreeMap<String, Metadata>,
    },
    DeleteMetadata {
        target_type: MetadataTarget,
        target_id: String,
        key: String,
    },
    SetMetadata {
        target_type: MetadataTarget,
        target_id: String,
        metadata: Metadata,
    },
}

impl LogData {
    pub fn log_type(&self) -> LogType {
        match self {
            Self::NewTransaction { .. } => LogType::NewTransaction,
            Self::SetMetadata { .. } => LogType::SetMetadata,
            Self::DeleteMetadata { .. } => LogType::DeleteMetadata,
            Self::RevertedTransaction { .. } => LogType::RevertedTransaction,
        }
    }
}

/// One entry of the per-ledger append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    /// Dense per-ledger id, starting at 0.
    pub id: u64,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub date: DateTime<Utc>,
    pub data: LogData,
    /// Hex SHA-256 over the canonical encoding; None when hashing is off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_hash: Option<String>,
}

impl Log {
    pub fn new(id: u64, date: DateTime<Utc>, data: LogData) -> Self {
        Self {
            id,
            log_type: data.log_type(),
            date,
            data,
            hash: None,
            idempotency_key: None,
            idempotency_hash: None,
        }
    }

    /// Hash of this entry chained onto `previous_hash`.
    ///
    /// The canonical form is serde_json over a BTreeMap-backed Value, so
    /// object keys are emitted sorted; the date is pinned to nanosecond
    /// RFC3339 so the encoding never varies with precision.
    pub fn compute_hash(&self, previous_hash: Option<&str>) -> String {
        let payload = json!({
            "previous_hash": previous_hash,
            "id": self.id,
            "type": self.log_type,
            "date": self.date.to_rfc3339_opts(SecondsFormat::Nanos, true),
            "data": self.data,
        });
        let bytes = serde_json::to_vec(&payload).expect("log payloads are always serializable");
        hex_digest(&bytes)
    }

    /// Chain this entry after `previous`, filling `hash`.
    pub fn chained_after(mut self, previous_hash: Option<&str>) -> Self {
        self.hash = Some(self.compute_hash(previous_hash));
        self
    }
}

/// Verify ids are dense from `start_id` and the hash chain connects,
/// starting from `previous_hash` (the destination head, None for genesis).
pub fn verify_chain(
    logs: &[Log],
    start_id: u64,
    mut previous_hash: Option<String>,
) -> Result<(), LedgerError> {
    let mut expected_id = start_id;
    for log in logs {
        if log.id != expected_id {
            return Err(LedgerError::ImportHashMismatch(log.id));
        }
        if let Some(hash) = &log.hash {
            if *hash != log.compute_hash(previous_hash.as_deref()) {
                return Err(LedgerError::ImportHashMismatch(log.id));
            }
            previous_hash = Some(hash.clone());
        }
        expected_id += 1;
    }
    Ok(())
}

/// Canonical SHA-256 of any JSON value, hex-encoded. Used for idempotency
/// body hashes and log chaining alike.
pub fn canonical_hash(value: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(value).expect("json values are always serializable");
    hex_digest(&bytes)
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{:02x}", b);
        acc
    })
}
