// src/core/volumes.rs
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::amount::Amount;

/// Running `(input, output)` pair for one `(account, asset)`.
///
/// Both sides are non-negative; the balance is `input - output`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Volumes {
    pub input: Amount,
    pub output: Amount,
}

impl Volumes {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn balance(&self) -> Amount {
        &self.input - &self.output
    }

    /// Apply one move delta: `input` grows when the account receives,
    /// `output` grows when it is the source.
    pub fn apply(&self, amount: &Amount, is_source: bool) -> Volumes {
        if is_source {
            Volumes {
                input: self.input.clone(),
                output: &self.output + amount,
            }
        } else {
            Volumes {
                input: &self.input + amount,
                output: self.output.clone(),
            }
        }
    }

    pub fn add(&self, other: &Volumes) -> Volumes {
        Volumes {
            input: &self.input + &other.input,
            output: &self.output + &other.output,
        }
    }
}

/// Per-asset volumes for one account.
pub type VolumesByAsset = BTreeMap<String, Volumes>;

/// Per-account per-asset volumes, as returned on committed transactions.
pub type PostCommitVolumes = BTreeMap<String, VolumesByAsset>;

/// Merge `delta` into `acc`, summing per (account, asset).
pub fn aggregate_volumes(acc: &mut VolumesByAsset, asset: &str, volumes: &Volumes) {
    acc.entry(asset.to_string())
        .and_modify(|v| *v = v.add(volumes))
        .or_insert_with(|| volumes.clone());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_is_input_minus_output() {
        let v = Volumes {
            input: Amount::from(100),
            output: Amount::from(30),
        };
        assert_eq!(v.balance(), Amount::from(70));
    }

    #[test]
    fn apply_direction() {
        let v = Volumes::zero();
        let received = v.apply(&Amount::from(10), false);
        assert_eq!(received.input, Amount::from(10));
        assert_eq!(received.output, Amount::zero());

        let sent = received.apply(&Amount::from(4), true);
        assert_eq!(sent.input, Amount::from(10));
        assert_eq!(sent.output, Amount::from(4));
        assert_eq!(sent.balance(), Amount::from(6));
    }

    #[test]
    fn aggregation_sums_per_asset() {
        let mut acc = VolumesByAsset::new();
        aggregate_volumes(
            &mut acc,
            "USD",
            &Volumes {
                input: Amount::from(5),
                output: Amount::zero(),
            },
        );
        aggregate_volumes(
            &mut acc,
            "USD",
            &Volumes {
                input: Amount::from(2),
                output: Amount::from(1),
            },
        );
        assert_eq!(acc["USD"].input, Amount::from(7));
        assert_eq!(acc["USD"].output, Amount::from(1));
    }
}
