// src/registry/mod.rs
//
// Process-wide catalog of ledgers: creation, lookup, and cached
// per-ledger controller handles.
pub mod features;
pub mod ledger;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::adapters::Driver;
use crate::core::Metadata;
use crate::engine::numscript::ScriptEvaluator;
use crate::engine::LedgerController;
use crate::error::LedgerError;
use crate::registry::ledger::{Ledger, LedgerConfig, State};

pub struct Registry {
    driver: Arc<dyn Driver>,
    evaluator: Arc<dyn ScriptEvaluator>,
    /// Controller handles are cached per ledger name; entries are dropped
    /// whenever migrations run so stale schema bindings cannot survive.
    controllers: RwLock<HashMap<String, LedgerController>>,
}

impl Registry {
    pub fn new(driver: Arc<dyn Driver>, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        Self {
            driver,
            evaluator,
            controllers: RwLock::new(HashMap::new()),
        }
    }

    /// Create a ledger: validate, persist INITIALIZING, migrate the bucket,
    /// then flip to IN_USE.
    pub async fn create_ledger(
        &self,
        name: &str,
        config: LedgerConfig,
    ) -> Result<Ledger, LedgerError> {
        let mut ledger = Ledger::new(name, config)?;
        self.driver.insert_ledger(&ledger).await?;
        self.driver.migrate_bucket(&ledger.bucket).await?;
        self.driver.update_ledger_state(name, State::InUse).await?;
        ledger.state = State::InUse;

        // migrations may have changed the bucket layout under cached handles
        self.invalidate_bucket(&ledger.bucket);

        info!(ledger = name, bucket = %ledger.bucket, "ledger created");
        Ok(ledger)
    }

    /// Handle bound to the ledger's bucket and feature flags.
    pub async fn controller(&self, name: &str) -> Result<LedgerController, LedgerError> {
        if let Some(controller) = self.controllers.read().unwrap().get(name) {
            return Ok(controller.clone());
        }

        let ledger = self
            .driver
            .get_ledger(name)
            .await?
            .ok_or_else(|| LedgerError::LedgerNotFound(name.to_string()))?;
        if ledger.state != State::InUse {
            return Err(LedgerError::LedgerNotFound(name.to_string()));
        }

        let store = self.driver.open_store(ledger.clone()).await?;
        let controller = LedgerController::new(ledger, store, self.evaluator.clone());
        self.controllers
            .write()
            .unwrap()
            .insert(name.to_string(), controller.clone());
        Ok(controller)
    }

    pub async fn get_ledger(&self, name: &str) -> Result<Ledger, LedgerError> {
        self.driver
            .get_ledger(name)
            .await?
            .ok_or_else(|| LedgerError::LedgerNotFound(name.to_string()))
    }

    pub async fn list_ledgers(&self) -> Result<Vec<Ledger>, LedgerError> {
        self.driver.list_ledgers().await
    }

    pub async fn update_ledger_metadata(
        &self,
        name: &str,
        metadata: Metadata,
    ) -> Result<(), LedgerError> {
        self.driver
            .update_ledger_metadata(name, metadata)
            .await
            .map_err(|err| match err {
                LedgerError::NotFound => LedgerError::LedgerNotFound(name.to_string()),
                other => other,
            })?;
        self.controllers.write().unwrap().remove(name);
        Ok(())
    }

    pub async fn delete_ledger_metadata(&self, name: &str, key: &str) -> Result<(), LedgerError> {
        self.driver
            .delete_ledger_metadata(name, key)
            .await
            .map_err(|err| match err {
                LedgerError::NotFound => LedgerError::LedgerNotFound(name.to_string()),
                other => other,
            })?;
        self.controllers.write().unwrap().remove(name);
        Ok(())
    }

    fn invalidate_bucket(&self, bucket: &str) {
        self.controllers
            .write()
            .unwrap()
            .retain(|_, controller| controller.ledger().bucket != bucket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryDriver;
    use crate::engine::numscript::NoScriptEvaluator;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryDriver::new()), Arc::new(NoScriptEvaluator))
    }

    #[tokio::test]
    async fn create_then_get() {
        let registry = registry();
        let ledger = registry
            .create_ledger("orders", LedgerConfig::default())
            .await
            .unwrap();
        assert_eq!(ledger.state, State::InUse);

        let controller = registry.controller("orders").await.unwrap();
        assert_eq!(controller.ledger().name, "orders");
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let registry = registry();
        registry
            .create_ledger("orders", LedgerConfig::default())
            .await
            .unwrap();
        assert!(matches!(
            registry
                .create_ledger("orders", LedgerConfig::default())
                .await,
            Err(LedgerError::LedgerAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn unknown_ledger_not_found() {
        let registry = registry();
        assert!(matches!(
            registry.controller("nope").await,
            Err(LedgerError::LedgerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_name_rejected() {
        let registry = registry();
        assert!(matches!(
            registry.create_ledger("Not Valid", LedgerConfig::default()).await,
            Err(LedgerError::InvalidLedgerName(_))
        ));
    }

    #[tokio::test]
    async fn controller_handles_are_cached() {
        let registry = registry();
        registry
            .create_ledger("orders", LedgerConfig::default())
            .await
            .unwrap();
        let first = registry.controller("orders").await.unwrap();
        let second = registry.controller("orders").await.unwrap();
        assert!(Arc::ptr_eq(first.store(), second.store()));
    }
}
