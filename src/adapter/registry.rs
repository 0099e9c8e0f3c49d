// ===============================
// src/adapter/registry.rs
// ===============================
//
// Closed, statically known table: broker name -> factory. Filled once at
// start-up through the builder; the frozen `Registry` is read-only.
//
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use tracing::info;

use super::{AdapterContext, BrokerAdapter};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::symbols::SymbolCache;

pub type AdapterFactory = fn(AdapterContext) -> Result<Arc<dyn BrokerAdapter>>;

#[derive(Default)]
pub struct RegistryBuilder {
    factories: HashMap<String, AdapterFactory>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names are case-insensitive. Registering the same name twice is a
    /// configuration error, not an override.
    pub fn register(mut self, name: &str, factory: AdapterFactory) -> Result<Self> {
        let key = name.trim().to_ascii_lowercase();
        if key.is_empty() || self.factories.contains_key(&key) {
            return Err(BridgeError::DuplicateBroker(name.to_string()));
        }
        self.factories.insert(key, factory);
        Ok(self)
    }

    pub fn build(self) -> Registry {
        Registry { factories: Arc::new(self.factories) }
    }
}

#[derive(Clone)]
pub struct Registry {
    factories: Arc<HashMap<String, AdapterFactory>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.trim().to_ascii_lowercase())
    }

    /// Sorted list of registered broker names.
    pub fn names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.factories.keys().cloned().collect();
        v.sort();
        v
    }

    /// Builds the adapter for `config.broker` with a fresh mapping cache.
    pub fn resolve(&self, config: &BridgeConfig) -> Result<Arc<dyn BrokerAdapter>> {
        let key = config.broker.trim().to_ascii_lowercase();
        let factory = self.factories.get(&key).ok_or_else(|| BridgeError::UnknownBroker {
            name: config.broker.clone(),
            known: self.names(),
        })?;
        let ctx = AdapterContext {
            config: Arc::new(config.clone()),
            contracts: Arc::new(SymbolCache::new(&key)),
        };
        let adapter = factory(ctx)?;
        info!(broker = %adapter.name(), capabilities = ?adapter.capabilities().iter().collect::<Vec<_>>(), "adapter resolved");
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Capabilities, Capability};
    use crate::symbols::{ContractEntry, ContractSource};
    use async_trait::async_trait;

    struct Dummy {
        contracts: Arc<SymbolCache>,
    }

    struct NoContracts;

    #[async_trait]
    impl ContractSource for NoContracts {
        async fn fetch_contracts(&self) -> Result<Vec<ContractEntry>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl BrokerAdapter for Dummy {
        fn name(&self) -> &str {
            "dummy"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::none()
        }
        fn contracts(&self) -> Arc<SymbolCache> {
            self.contracts.clone()
        }
        fn contract_source(&self) -> Arc<dyn ContractSource> {
            Arc::new(NoContracts)
        }
    }

    fn dummy(ctx: AdapterContext) -> Result<Arc<dyn BrokerAdapter>> {
        Ok(Arc::new(Dummy { contracts: ctx.contracts }))
    }

    fn cfg(broker: &str) -> BridgeConfig {
        BridgeConfig { broker: broker.to_string(), ..BridgeConfig::default() }
    }

    #[tokio::test]
    async fn resolves_case_insensitively_and_reports_unknown() {
        let reg = Registry::builder().register("Dummy", dummy).unwrap().build();
        let adapter = reg.resolve(&cfg("DUMMY")).unwrap();
        assert_eq!(adapter.name(), "dummy");

        let err = adapter.place_order(&crate::domain::CanonicalOrder::market("A", "B", crate::domain::Side::Buy, 1)).await.unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedCapability { capability: Capability::PlaceOrder, .. }));
        assert!(adapter.start_stream().await.is_err());

        match reg.resolve(&cfg("nope")) {
            Err(BridgeError::UnknownBroker { known, .. }) => assert_eq!(known, vec!["dummy".to_string()]),
            other => panic!("unexpected: {:?}", other.map(|a| a.name().to_string())),
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let res = Registry::builder().register("x", dummy).unwrap().register("X", dummy);
        assert!(matches!(res, Err(BridgeError::DuplicateBroker(_))));
    }
}
