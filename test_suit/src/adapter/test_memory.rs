#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use talanton::adapters::memory::MemoryDriver;
#[cfg(test)]
use talanton::{LedgerConfig, NoScriptEvaluator, Registry};

#[cfg(test)]
use crate::scenarios::run_core_scenarios;

#[tokio::test]
async fn memory_adapter_passes_core_scenarios() {
    let registry = Registry::new(Arc::new(MemoryDriver::new()), Arc::new(NoScriptEvaluator));
    registry
        .create_ledger("suite", LedgerConfig::default())
        .await
        .unwrap();
    let controller = registry.controller("suite").await.unwrap();
    run_core_scenarios(&controller).await;
}
