// src/registry/features.rs
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Features toggle the on-disk shape of a ledger and the query strategies
/// available on it. They are fixed at ledger creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Feature {
    AccountMetadataHistory,
    TransactionMetadataHistory,
    MovesHistory,
    MovesHistoryPostCommitEffectiveVolumes,
    HashLogs,
    IndexAddressSegments,
}

pub const ALL_FEATURES: [Feature; 6] = [
    Feature::AccountMetadataHistory,
    Feature::TransactionMetadataHistory,
    Feature::MovesHistory,
    Feature::MovesHistoryPostCommitEffectiveVolumes,
    Feature::HashLogs,
    Feature::IndexAddressSegments,
];

impl Feature {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AccountMetadataHistory => "ACCOUNT_METADATA_HISTORY",
            Self::TransactionMetadataHistory => "TRANSACTION_METADATA_HISTORY",
            Self::MovesHistory => "MOVES_HISTORY",
            Self::MovesHistoryPostCommitEffectiveVolumes => {
                "MOVES_HISTORY_POST_COMMIT_EFFECTIVE_VOLUMES"
            }
            Self::HashLogs => "HASH_LOGS",
            Self::IndexAddressSegments => "INDEX_ADDRESS_SEGMENTS",
        }
    }

    pub fn from_name(name: &str) -> Option<Feature> {
        ALL_FEATURES.iter().copied().find(|f| f.name() == name)
    }

    /// The value that turns the feature on.
    pub fn enabled_value(&self) -> &'static str {
        match self {
            Self::MovesHistory | Self::IndexAddressSegments => "ON",
            _ => "SYNC",
        }
    }

    pub fn allowed_values(&self) -> [&'static str; 2] {
        ["OFF", self.enabled_value()]
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Feature name to value, e.g. `MOVES_HISTORY -> ON`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet(BTreeMap<String, String>);

impl FeatureSet {
    /// Every feature at its most capable setting.
    pub fn default_features() -> Self {
        let mut set = BTreeMap::new();
        for feature in ALL_FEATURES {
            set.insert(feature.name().to_string(), feature.enabled_value().to_string());
        }
        Self(set)
    }

    /// Everything off. Useful for write-heavy ledgers that never query history.
    pub fn minimal() -> Self {
        let mut set = BTreeMap::new();
        for feature in ALL_FEATURES {
            set.insert(feature.name().to_string(), "OFF".to_string());
        }
        Self(set)
    }

    pub fn with_feature(mut self, feature: Feature, value: &str) -> Self {
        self.0.insert(feature.name().to_string(), value.to_string());
        self
    }

    pub fn value(&self, feature: Feature) -> &str {
        self.0
            .get(feature.name())
            .map(String::as_str)
            .unwrap_or("OFF")
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.value(feature) == feature.enabled_value()
    }

    /// Reject unknown features, unknown values and incoherent combinations.
    pub fn validate(&self) -> Result<(), LedgerError> {
        for (name, value) in &self.0 {
            let feature = Feature::from_name(name).ok_or_else(|| {
                LedgerError::InvalidFeature(format!("unknown feature {}", name))
            })?;
            if !feature.allowed_values().contains(&value.as_str()) {
                return Err(LedgerError::InvalidFeature(format!(
                    "feature {} does not accept value {}",
                    name, value
                )));
            }
        }
        if self.is_enabled(Feature::MovesHistoryPostCommitEffectiveVolumes)
            && !self.is_enabled(Feature::MovesHistory)
        {
            return Err(LedgerError::InvalidFeature(format!(
                "{} requires {}",
                Feature::MovesHistoryPostCommitEffectiveVolumes,
                Feature::MovesHistory
            )));
        }
        Ok(())
    }
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self::default_features()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_enabled() {
        let set = FeatureSet::default_features();
        assert!(set.validate().is_ok());
        for feature in ALL_FEATURES {
            assert!(set.is_enabled(feature), "{}", feature);
        }
    }

    #[test]
    fn minimal_is_valid_and_disabled() {
        let set = FeatureSet::minimal();
        assert!(set.validate().is_ok());
        for feature in ALL_FEATURES {
            assert!(!set.is_enabled(feature), "{}", feature);
        }
    }

    #[test]
    fn effective_volumes_requires_moves_history() {
        let set = FeatureSet::minimal()
            .with_feature(Feature::MovesHistoryPostCommitEffectiveVolumes, "SYNC");
        assert!(set.validate().is_err());

        let set = set.with_feature(Feature::MovesHistory, "ON");
        assert!(set.validate().is_ok());
    }

    #[test]
    fn unknown_feature_and_value_rejected() {
        let mut raw = BTreeMap::new();
        raw.insert("NOT_A_FEATURE".to_string(), "ON".to_string());
        assert!(FeatureSet(raw).validate().is_err());

        let set = FeatureSet::minimal().with_feature(Feature::HashLogs, "ON");
        assert!(set.validate().is_err(), "HASH_LOGS only accepts OFF/SYNC");
    }

    #[test]
    fn missing_entry_defaults_off() {
        let set = FeatureSet(BTreeMap::new());
        assert_eq!(set.value(Feature::MovesHistory), "OFF");
        assert!(!set.is_enabled(Feature::MovesHistory));
    }
}
