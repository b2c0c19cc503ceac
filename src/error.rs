// src/error.rs
use std::fmt;

use crate::core::Amount;

/// Classification of a script evaluator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptErrorKind {
    Parse,
    Compilation,
    Runtime,
}

#[derive(Debug)]
pub enum LedgerError {
    // validation
    Validation(String),
    NoPostings,
    InvalidTimestamp(String),
    InvalidLedgerName(String),
    InvalidFeature(String),
    InvalidQuery(String),
    MissingFeature(String),

    // business
    InsufficientFund {
        account: String,
        asset: String,
        required: Amount,
        available: Amount,
    },
    ReferenceConflict(String),
    IdempotencyKeyConflict(String),
    AlreadyReverted(u64),
    MetadataOverride(String),
    IdempotencyViolation(String),
    ImportHashMismatch(u64),

    // script
    Script {
        kind: ScriptErrorKind,
        message: String,
    },

    // system
    OutdatedSchema(String),
    LedgerNotFound(String),
    LedgerAlreadyExists(String),
    BucketOutdated(String),
    NotFound,
    /// Retryable write conflict, consumed by the commit retry loop.
    Deadlock,
    Storage(String),
    Internal {
        correlation_id: uuid::Uuid,
        message: String,
    },
}

impl LedgerError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            correlation_id: uuid::Uuid::now_v7(),
            message: message.into(),
        }
    }

    /// Stable error code surfaced to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::NoPostings => "NO_POSTINGS",
            Self::InvalidTimestamp(_) => "INVALID_TIMESTAMP",
            Self::InvalidLedgerName(_) => "INVALID_LEDGER_NAME",
            Self::InvalidFeature(_) => "INVALID_FEATURE",
            Self::InvalidQuery(_) => "INVALID_QUERY",
            Self::MissingFeature(_) => "MISSING_FEATURE",
            Self::InsufficientFund { .. } => "INSUFFICIENT_FUND",
            Self::ReferenceConflict(_) | Self::IdempotencyKeyConflict(_) => "CONFLICT",
            Self::AlreadyReverted(_) => "ALREADY_REVERT",
            Self::MetadataOverride(_) => "METADATA_OVERRIDE",
            Self::IdempotencyViolation(_) => "IDEMPOTENCY_VIOLATION",
            Self::ImportHashMismatch(_) => "IMPORT_HASH_MISMATCH",
            Self::Script { kind, .. } => match kind {
                ScriptErrorKind::Parse => "INTERPRETER_PARSE",
                ScriptErrorKind::Compilation => "COMPILATION_FAILED",
                ScriptErrorKind::Runtime => "INTERPRETER_RUNTIME",
            },
            Self::OutdatedSchema(_) => "OUTDATED_SCHEMA",
            Self::LedgerNotFound(_) => "LEDGER_NOT_FOUND",
            Self::LedgerAlreadyExists(_) => "LEDGER_ALREADY_EXISTS",
            Self::BucketOutdated(_) => "BUCKET_OUTDATED",
            Self::NotFound => "NOT_FOUND",
            Self::Deadlock | Self::Storage(_) | Self::Internal { .. } => "INTERNAL",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Deadlock)
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation error: {}", msg),
            Self::NoPostings => write!(f, "transaction has no postings"),
            Self::InvalidTimestamp(msg) => write!(f, "invalid timestamp: {}", msg),
            Self::InvalidLedgerName(name) => write!(f, "invalid ledger name: {}", name),
            Self::InvalidFeature(msg) => write!(f, "invalid feature: {}", msg),
            Self::InvalidQuery(msg) => write!(f, "invalid query: {}", msg),
            Self::MissingFeature(feature) => {
                write!(f, "query requires disabled feature: {}", feature)
            }
            Self::InsufficientFund {
                account,
                asset,
                required,
                available,
            } => write!(
                f,
                "insufficient funds on {} for {}: required {}, available {}",
                account, asset, required, available
            ),
            Self::ReferenceConflict(reference) => {
                write!(f, "reference already used: {}", reference)
            }
            Self::IdempotencyKeyConflict(key) => {
                write!(f, "idempotency key already registered: {}", key)
            }
            Self::AlreadyReverted(id) => write!(f, "transaction {} already reverted", id),
            Self::MetadataOverride(key) => {
                write!(f, "script refused to override metadata key: {}", key)
            }
            Self::IdempotencyViolation(key) => {
                write!(f, "idempotency key {} reused with a different body", key)
            }
            Self::ImportHashMismatch(id) => {
                write!(f, "hash chain broken at imported log {}", id)
            }
            Self::Script { message, .. } => write!(f, "script error: {}", message),
            Self::OutdatedSchema(bucket) => {
                write!(f, "bucket {} schema is out of date", bucket)
            }
            Self::LedgerNotFound(name) => write!(f, "ledger not found: {}", name),
            Self::LedgerAlreadyExists(name) => write!(f, "ledger already exists: {}", name),
            Self::BucketOutdated(bucket) => {
                write!(f, "bucket {} was created by a newer version", bucket)
            }
            Self::NotFound => write!(f, "not found"),
            Self::Deadlock => write!(f, "write conflict"),
            Self::Storage(msg) => write!(f, "storage error: {}", msg),
            Self::Internal {
                correlation_id,
                message,
            } => write!(f, "internal error [{}]: {}", correlation_id, message),
        }
    }
}

impl std::error::Error for LedgerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_codes() {
        assert_eq!(LedgerError::NoPostings.code(), "NO_POSTINGS");
        assert_eq!(
            LedgerError::ReferenceConflict("r1".into()).code(),
            "CONFLICT"
        );
        assert_eq!(
            LedgerError::IdempotencyKeyConflict("k1".into()).code(),
            "CONFLICT"
        );
        assert_eq!(LedgerError::Deadlock.code(), "INTERNAL");
        assert_eq!(
            LedgerError::Script {
                kind: ScriptErrorKind::Compilation,
                message: "bad".into()
            }
            .code(),
            "COMPILATION_FAILED"
        );
    }

    #[test]
    fn internal_carries_correlation_id() {
        let err = LedgerError::internal("boom");
        let rendered = err.to_string();
        if let LedgerError::Internal { correlation_id, .. } = err {
            assert!(rendered.contains(&correlation_id.to_string()));
        } else {
            panic!("expected internal error");
        }
    }
}
