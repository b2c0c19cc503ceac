// src/registry/ledger.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::Metadata;
use crate::error::LedgerError;
use crate::registry::features::FeatureSet;

pub const DEFAULT_BUCKET: &str = "default";

/// Names for ledgers and buckets: `[a-z0-9_-]{1,63}`.
pub fn validate_name(name: &str) -> Result<(), LedgerError> {
    let ok = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(LedgerError::InvalidLedgerName(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Created but migrations not finished; rejects traffic.
    Initializing,
    InUse,
}

/// Creation-time configuration of a ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default)]
    pub features: Option<FeatureSet>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Catalog entry for one ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    pub name: String,
    /// Physical storage namespace; many ledgers may share one bucket.
    pub bucket: String,
    pub features: FeatureSet,
    pub metadata: Metadata,
    pub state: State,
    pub added_at: DateTime<Utc>,
}

impl Ledger {
    pub fn new(name: &str, config: LedgerConfig) -> Result<Self, LedgerError> {
        validate_name(name)?;
        let bucket = config.bucket.unwrap_or_else(|| DEFAULT_BUCKET.to_string());
        validate_name(&bucket)
            .map_err(|_| LedgerError::InvalidLedgerName(format!("bucket {}", bucket)))?;
        let features = config.features.unwrap_or_default();
        features.validate()?;
        Ok(Self {
            name: name.to_string(),
            bucket,
            features,
            metadata: config.metadata,
            state: State::Initializing,
            added_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::features::Feature;

    #[test]
    fn name_shapes() {
        assert!(validate_name("orders").is_ok());
        assert!(validate_name("orders-2024_eu").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Orders").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name(&"x".repeat(64)).is_err());
        assert!(validate_name(&"x".repeat(63)).is_ok());
    }

    #[test]
    fn new_ledger_defaults() {
        let ledger = Ledger::new("orders", LedgerConfig::default()).unwrap();
        assert_eq!(ledger.bucket, DEFAULT_BUCKET);
        assert_eq!(ledger.state, State::Initializing);
        assert!(ledger.features.is_enabled(Feature::MovesHistory));
    }

    #[test]
    fn invalid_feature_set_rejected() {
        let config = LedgerConfig {
            features: Some(
                FeatureSet::minimal()
                    .with_feature(Feature::MovesHistoryPostCommitEffectiveVolumes, "SYNC"),
            ),
            ..Default::default()
        };
        assert!(Ledger::new("orders", config).is_err());
    }

    #[test]
    fn invalid_bucket_rejected() {
        let config = LedgerConfig {
            bucket: Some("No Bucket".to_string()),
            ..Default::default()
        };
        assert!(Ledger::new("orders", config).is_err());
    }
}
