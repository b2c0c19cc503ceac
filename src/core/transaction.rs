// src/core/transaction.rs
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::amount::Amount;
use crate::core::metadata::Metadata;
use crate::core::posting::Posting;
use crate::core::volumes::PostCommitVolumes;
use crate::error::LedgerError;

/// A transaction intent, before commit assigns an id and volumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionData {
    pub postings: Vec<Posting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl TransactionData {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.postings.is_empty() {
            return Err(LedgerError::NoPostings);
        }
        for posting in &self.postings {
            posting.validate()?;
        }
        check_conservation(&self.postings)
    }
}

/// Per asset, the sum of source amounts must equal the sum of destination
/// amounts.
pub fn check_conservation(postings: &[Posting]) -> Result<(), LedgerError> {
    let mut sources: BTreeMap<&str, Amount> = BTreeMap::new();
    let mut destinations: BTreeMap<&str, Amount> = BTreeMap::new();
    for posting in postings {
        *sources.entry(posting.asset.as_str()).or_default() += &posting.amount;
        *destinations.entry(posting.asset.as_str()).or_default() += &posting.amount;
    }
    for (asset, sourced) in &sources {
        if destinations.get(asset) != Some(sourced) {
            return Err(LedgerError::Validation(format!(
                "unbalanced postings for asset {}",
                asset
            )));
        }
    }
    Ok(())
}

/// A committed transaction.
///
/// Immutable once committed, except for `metadata` and `reverted_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Dense per-ledger id, starting at 0.
    pub id: u64,
    pub postings: Vec<Posting>,
    /// Effective (business) timestamp.
    pub timestamp: DateTime<Utc>,
    /// Wall clock of persistence.
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverted_at: Option<DateTime<Utc>>,
    /// Volumes of each touched (account, asset) right after this commit,
    /// in insertion order. Populated when moves history is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_commit_volumes: Option<PostCommitVolumes>,
}

impl Transaction {
    pub fn is_reverted(&self) -> bool {
        self.reverted_at.is_some()
    }

    /// Build the compensating intent that undoes this transaction.
    pub fn reversal(&self, at_effective_date: Option<DateTime<Utc>>) -> TransactionData {
        TransactionData {
            postings: self.postings.iter().map(Posting::mirror).collect(),
            timestamp: at_effective_date,
            reference: None,
            metadata: Metadata::new(),
        }
    }

    /// Every account touched by this transaction, deduplicated.
    pub fn involved_accounts(&self) -> Vec<&crate::core::account::AccountAddress> {
        let mut accounts: Vec<_> = self
            .postings
            .iter()
            .flat_map(|p| [&p.source, &p.destination])
            .collect();
        accounts.sort();
        accounts.dedup();
        accounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::account::AccountAddress;

    fn data(postings: Vec<Posting>) -> TransactionData {
        TransactionData {
            postings,
            ..Default::default()
        }
    }

    fn posting(source: &str, destination: &str, amount: i64) -> Posting {
        Posting::new(
            AccountAddress::new(source).unwrap(),
            AccountAddress::new(destination).unwrap(),
            Amount::from(amount),
            "USD",
        )
    }

    #[test]
    fn empty_postings_rejected() {
        assert!(matches!(
            data(vec![]).validate(),
            Err(LedgerError::NoPostings)
        ));
    }

    #[test]
    fn valid_data_passes() {
        assert!(data(vec![posting("world", "alice", 100)]).validate().is_ok());
    }

    #[test]
    fn reversal_mirrors_postings() {
        let tx = Transaction {
            id: 0,
            postings: vec![posting("world", "alice", 100)],
            timestamp: Utc::now(),
            inserted_at: Utc::now(),
            updated_at: Utc::now(),
            reference: Some("r1".to_string()),
            metadata: Metadata::new(),
            reverted_at: None,
            post_commit_volumes: None,
        };
        let reversal = tx.reversal(None);
        assert_eq!(reversal.postings[0].source.as_str(), "alice");
        assert_eq!(reversal.postings[0].destination.as_str(), "world");
        assert!(reversal.reference.is_none());
    }

    #[test]
    fn involved_accounts_deduplicated() {
        let tx = Transaction {
            id: 0,
            postings: vec![posting("world", "alice", 1), posting("world", "bob", 2)],
            timestamp: Utc::now(),
            inserted_at: Utc::now(),
            updated_at: Utc::now(),
            reference: None,
            metadata: Metadata::new(),
            reverted_at: None,
            post_commit_volumes: None,
        };
        let accounts: Vec<_> = tx
            .involved_accounts()
            .into_iter()
            .map(|a| a.as_str())
            .collect();
        assert_eq!(accounts, vec!["alice", "bob", "world"]);
    }
}
