// src/core/posting.rs
use serde::{Deserialize, Serialize};

use crate::core::account::AccountAddress;
use crate::core::amount::Amount;
use crate::error::LedgerError;

/// One directed value movement between two accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub source: AccountAddress,
    pub destination: AccountAddress,
    pub amount: Amount,
    pub asset: String,
}

impl Posting {
    pub fn new(
        source: AccountAddress,
        destination: AccountAddress,
        amount: Amount,
        asset: impl Into<String>,
    ) -> Self {
        Self {
            source,
            destination,
            amount,
            asset: asset.into(),
        }
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if !self.amount.is_positive() {
            return Err(LedgerError::Validation(format!(
                "posting amount must be positive, got {}",
                self.amount
            )));
        }
        if self.source == self.destination {
            return Err(LedgerError::Validation(format!(
                "source and destination are identical: {}",
                self.source
            )));
        }
        validate_asset(&self.asset)?;
        Ok(())
    }

    /// The compensating posting used when reverting a transaction.
    pub fn mirror(&self) -> Posting {
        Posting {
            source: self.destination.clone(),
            destination: self.source.clone(),
            amount: self.amount.clone(),
            asset: self.asset.clone(),
        }
    }
}

/// Asset codes look like `USD` or `USD/2`; the `/N` suffix is descriptive only.
pub fn validate_asset(asset: &str) -> Result<(), LedgerError> {
    let (code, scale) = match asset.split_once('/') {
        Some((code, scale)) => (code, Some(scale)),
        None => (asset, None),
    };

    let code_ok = !code.is_empty()
        && code.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    let scale_ok = match scale {
        None => true,
        Some(s) => !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
    };

    if code_ok && scale_ok {
        Ok(())
    } else {
        Err(LedgerError::Validation(format!("invalid asset: {}", asset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posting(source: &str, destination: &str, amount: i64) -> Posting {
        Posting::new(
            AccountAddress::new(source).unwrap(),
            AccountAddress::new(destination).unwrap(),
            Amount::from(amount),
            "USD",
        )
    }

    #[test]
    fn valid_posting() {
        assert!(posting("world", "alice", 100).validate().is_ok());
    }

    #[test]
    fn zero_amount_rejected() {
        assert!(posting("world", "alice", 0).validate().is_err());
    }

    #[test]
    fn negative_amount_rejected() {
        assert!(posting("world", "alice", -5).validate().is_err());
    }

    #[test]
    fn self_transfer_rejected() {
        assert!(posting("alice", "alice", 10).validate().is_err());
    }

    #[test]
    fn asset_shapes() {
        assert!(validate_asset("USD").is_ok());
        assert!(validate_asset("USD/2").is_ok());
        assert!(validate_asset("BTC2").is_ok());
        assert!(validate_asset("usd").is_err());
        assert!(validate_asset("USD/").is_err());
        assert!(validate_asset("/2").is_err());
        assert!(validate_asset("").is_err());
    }

    #[test]
    fn mirror_swaps_endpoints() {
        let p = posting("alice", "bob", 10);
        let m = p.mirror();
        assert_eq!(m.source, p.destination);
        assert_eq!(m.destination, p.source);
        assert_eq!(m.amount, p.amount);
    }
}
