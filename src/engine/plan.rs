// src/engine/plan.rs
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::core::{Amount, Metadata, Posting};
use crate::error::LedgerError;

/// Idempotency key plus the canonical hash of the request body it was
/// first used with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyInfo {
    pub key: String,
    pub hash: String,
}

/// Everything the storage engine needs to apply one commit atomically.
///
/// Built by the commit controller after script evaluation, validation and
/// timestamp resolution; the store re-checks everything that depends on
/// concurrent state (balances, timestamps, reference and idempotency
/// uniqueness, reverted-at) under its own locks.
#[derive(Debug, Clone)]
pub struct CommitPlan {
    pub postings: Vec<Posting>,
    /// Resolved effective timestamp.
    pub timestamp: DateTime<Utc>,
    /// Back-dating accepted (effective-volumes feature is SYNC); otherwise a
    /// timestamp behind the ledger head fails INVALID_TIMESTAMP.
    pub allow_backdating: bool,
    pub reference: Option<String>,
    pub metadata: Metadata,
    /// Account metadata suggested by the script, keyed by address.
    pub account_metadata: BTreeMap<String, Metadata>,
    /// Id of the transaction being reverted, for compensating commits.
    pub reverts: Option<u64>,
    /// True for forced reversions: sources may go negative.
    pub skip_balance_checks: bool,
    pub idempotency: Option<IdempotencyInfo>,
}

impl CommitPlan {
    pub fn for_postings(postings: Vec<Posting>, timestamp: DateTime<Utc>) -> Self {
        Self {
            postings,
            timestamp,
            allow_backdating: false,
            reference: None,
            metadata: Metadata::new(),
            account_metadata: BTreeMap::new(),
            reverts: None,
            skip_balance_checks: false,
            idempotency: None,
        }
    }
}

/// Walk the postings in order against the loaded balances, failing on the
/// first bounded source that would go negative. `world`-rooted sources are
/// unbounded. Balances are keyed by `(address, asset)` and mutated in place,
/// so the caller sees the post-plan balances on success.
pub fn check_balances(
    postings: &[Posting],
    balances: &mut BTreeMap<(String, String), Amount>,
) -> Result<(), LedgerError> {
    for posting in postings {
        let source_key = (posting.source.as_str().to_string(), posting.asset.clone());
        let available = balances.entry(source_key.clone()).or_default().clone();
        let after = &available - &posting.amount;
        if after.is_negative() && !posting.source.is_world() {
            return Err(LedgerError::InsufficientFund {
                account: posting.source.as_str().to_string(),
                asset: posting.asset.clone(),
                required: posting.amount.clone(),
                available,
            });
        }
        balances.insert(source_key, after);

        let destination_key = (
            posting.destination.as_str().to_string(),
            posting.asset.clone(),
        );
        let destination = balances.entry(destination_key).or_default();
        *destination += &posting.amount;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AccountAddress;

    fn posting(source: &str, destination: &str, amount: i64) -> Posting {
        Posting::new(
            AccountAddress::new(source).unwrap(),
            AccountAddress::new(destination).unwrap(),
            Amount::from(amount),
            "USD",
        )
    }

    #[test]
    fn world_is_unbounded() {
        let mut balances = BTreeMap::new();
        assert!(check_balances(&[posting("world", "alice", 1_000_000)], &mut balances).is_ok());
        assert_eq!(
            balances[&("world".to_string(), "USD".to_string())],
            Amount::from(-1_000_000)
        );
    }

    #[test]
    fn bounded_source_fails_with_details() {
        let mut balances = BTreeMap::from([(
            ("alice".to_string(), "USD".to_string()),
            Amount::from(100),
        )]);
        let err = check_balances(&[posting("alice", "bob", 150)], &mut balances).unwrap_err();
        match err {
            LedgerError::InsufficientFund {
                account,
                asset,
                required,
                available,
            } => {
                assert_eq!(account, "alice");
                assert_eq!(asset, "USD");
                assert_eq!(required, Amount::from(150));
                assert_eq!(available, Amount::from(100));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn earlier_postings_fund_later_ones() {
        let mut balances = BTreeMap::new();
        // alice has nothing, but the first posting funds her before she spends
        assert!(check_balances(
            &[posting("world", "alice", 100), posting("alice", "bob", 60)],
            &mut balances
        )
        .is_ok());
        assert_eq!(
            balances[&("alice".to_string(), "USD".to_string())],
            Amount::from(40)
        );
    }

    #[test]
    fn ordering_matters() {
        let mut balances = BTreeMap::new();
        // spending before being funded fails even though the net is positive
        assert!(check_balances(
            &[posting("alice", "bob", 60), posting("world", "alice", 100)],
            &mut balances
        )
        .is_err());
    }
}
