//! Multi-tenant bitemporal double-entry ledger core.
//!
//! Clients submit transactions (plain postings or a script evaluated
//! against ledger state); commits are atomic, strictly ordered per ledger,
//! exact (arbitrary-precision), and queryable at any point in time.
//!
//! The crate is layered leaves-first: [`core`] holds the domain primitives,
//! [`registry`] the ledger catalog, [`adapters`] the storage engine (memory
//! and Postgres behind one trait), [`engine`] the commit controller, and
//! [`query`] the read pipeline.

pub mod adapters;
pub mod core;
pub mod engine;
pub mod error;
pub mod query;
pub mod registry;

pub use adapters::{BalanceReader, CommitOutcome, Driver, LedgerStore};
pub use core::{
    Account, AccountAddress, Amount, Log, LogData, LogType, Metadata, Posting, Transaction,
    TransactionData, Volumes, VolumesByAsset,
};
pub use engine::numscript::{NoScriptEvaluator, ScriptEvaluator, ScriptResult};
pub use engine::{LedgerController, RevertOptions, RunScript, TransactionInput};
pub use error::LedgerError;
pub use query::cursor::Cursor;
pub use query::filter::Filter;
pub use query::QueryController;
pub use registry::features::{Feature, FeatureSet};
pub use registry::ledger::{Ledger, LedgerConfig};
pub use registry::Registry;
