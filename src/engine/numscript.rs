// src/engine/numscript.rs
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::adapters::BalanceReader;
use crate::core::{Metadata, Posting};
use crate::error::{LedgerError, ScriptErrorKind};

/// Output of one script evaluation.
#[derive(Debug, Clone, Default)]
pub struct ScriptResult {
    pub postings: Vec<Posting>,
    /// Metadata the script attaches to the transaction.
    pub transaction_metadata: Metadata,
    /// Metadata the script attaches to accounts, keyed by address.
    pub account_metadata: BTreeMap<String, Metadata>,
}

/// The numeric-script compiler/VM, as a collaborator.
///
/// The storage core never embeds an implementation: deployments plug in a
/// real interpreter, tests plug in stubs. Balance reads go through the
/// provided reader so the evaluator observes the same snapshot the commit
/// will be checked against.
#[async_trait]
pub trait ScriptEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        plain: &str,
        vars: &BTreeMap<String, Value>,
        reader: &dyn BalanceReader,
    ) -> Result<ScriptResult, LedgerError>;
}

/// Default evaluator for deployments without a script VM: every script
/// fails to compile.
pub struct NoScriptEvaluator;

#[async_trait]
impl ScriptEvaluator for NoScriptEvaluator {
    async fn evaluate(
        &self,
        _plain: &str,
        _vars: &BTreeMap<String, Value>,
        _reader: &dyn BalanceReader,
    ) -> Result<ScriptResult, LedgerError> {
        Err(LedgerError::Script {
            kind: ScriptErrorKind::Compilation,
            message: "no script evaluator configured".to_string(),
        })
    }
}
