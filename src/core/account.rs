// src/core/account.rs
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::metadata::Metadata;
use crate::core::volumes::VolumesByAsset;
use crate::error::LedgerError;

/// Slash-delimited account address, e.g. `users/1234/wallet`.
///
/// Each segment matches `[a-zA-Z0-9_]+`. Addresses whose first segment is
/// `world` designate unbounded sources.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountAddress(String);

impl AccountAddress {
    pub fn new(address: impl Into<String>) -> Result<Self, LedgerError> {
        let address = address.into();
        if address.is_empty() {
            return Err(LedgerError::Validation("empty account address".to_string()));
        }
        for segment in address.split('/') {
            if segment.is_empty()
                || !segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(LedgerError::Validation(format!(
                    "invalid account address: {}",
                    address
                )));
            }
        }
        Ok(Self(address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Unbounded sources may go arbitrarily negative.
    pub fn is_world(&self) -> bool {
        self.segments().next() == Some("world")
    }
}

impl fmt::Display for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AccountAddress {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AccountAddress {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AccountAddress> for String {
    fn from(value: AccountAddress) -> String {
        value.0
    }
}

/// One account row as surfaced by queries.
///
/// Accounts are created lazily by the first posting that references them and
/// are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub address: AccountAddress,
    pub metadata: Metadata,
    /// Earliest effective timestamp of any move touching this account.
    pub first_usage: DateTime<Utc>,
    /// Wall clock of first persistence.
    pub insertion_date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<VolumesByAsset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_volumes: Option<VolumesByAsset>,
}

impl Account {
    pub fn new(address: AccountAddress, at: DateTime<Utc>) -> Self {
        Self {
            address,
            metadata: Metadata::new(),
            first_usage: at,
            insertion_date: at,
            updated_at: at,
            volumes: None,
            effective_volumes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_addresses() {
        for addr in ["world", "users/1234/wallet", "a_b/C9"] {
            assert!(AccountAddress::new(addr).is_ok(), "{}", addr);
        }
    }

    #[test]
    fn invalid_addresses() {
        for addr in ["", "/", "a//b", "a/", "/a", "a b", "a:b", "é"] {
            assert!(AccountAddress::new(addr).is_err(), "{:?}", addr);
        }
    }

    #[test]
    fn world_detection() {
        assert!(AccountAddress::new("world").unwrap().is_world());
        assert!(AccountAddress::new("world/eu").unwrap().is_world());
        assert!(!AccountAddress::new("worldwide").unwrap().is_world());
        assert!(!AccountAddress::new("users/world").unwrap().is_world());
    }
}
