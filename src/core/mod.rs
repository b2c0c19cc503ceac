// src/core/mod.rs
pub mod account;
pub mod amount;
pub mod log;
pub mod metadata;
pub mod posting;
pub mod transaction;
pub mod volumes;

pub use account::{Account, AccountAddress};
pub use amount::Amount;
pub use log::{canonical_hash, verify_chain, Log, LogData, LogType, MetadataTarget};
pub use metadata::Metadata;
pub use posting::Posting;
pub use transaction::{check_conservation, Transaction, TransactionData};
pub use volumes::{aggregate_volumes, PostCommitVolumes, Volumes, VolumesByAsset};
