//! Name-keyed set of provider adapters.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use super::ProviderAdapter;
use super::http::provider_client;
use super::digitalocean::{DigitalOceanConfig, DigitalOceanProvider};
use super::mock::MockProvider;
use super::virtfusion::{VirtFusionConfig, VirtFusionProvider};

/// Adapters available to the engine, looked up by the `provider` field of an
/// instance request.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an adapter, replacing any adapter with the same name.
    #[must_use]
    pub fn with(mut self, adapter: impl ProviderAdapter + 'static) -> Self {
        self.insert(Arc::new(adapter));
        self
    }

    /// Adds a shared adapter, replacing any adapter with the same name.
    pub fn insert(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_owned(), adapter);
    }

    /// Looks up an adapter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(name).map(Arc::clone)
    }

    /// Returns `true` when `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    /// Builds a registry from the environment: the mock adapter is always
    /// present, and each hosted provider is added when its configuration
    /// loads and validates. Hosted adapters share one HTTP client.
    #[must_use]
    pub fn from_environment() -> Self {
        let mut registry = Self::new().with(MockProvider::new());
        let client = match provider_client() {
            Ok(client) => client,
            Err(err) => {
                warn!(error = %err, "hosted providers disabled");
                return registry;
            }
        };

        match VirtFusionConfig::load_without_cli_args()
            .map_err(|err| err.to_string())
            .and_then(|config| {
                VirtFusionProvider::new(config, client.clone()).map_err(|err| err.to_string())
            }) {
            Ok(adapter) => registry.insert(Arc::new(adapter)),
            Err(reason) => info!(provider = "virtfusion", %reason, "provider not configured"),
        }

        match DigitalOceanConfig::load_without_cli_args()
            .map_err(|err| err.to_string())
            .and_then(|config| {
                DigitalOceanProvider::new(config, client).map_err(|err| err.to_string())
            }) {
            Ok(adapter) => registry.insert(Arc::new(adapter)),
            Err(reason) => info!(provider = "digitalocean", %reason, "provider not configured"),
        }

        if registry.adapters.len() == 1 {
            warn!("only the mock provider is registered");
        }
        registry
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("adapters", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_adapters_by_name() {
        let registry = ProviderRegistry::new().with(MockProvider::new());

        assert!(registry.contains("mock"));
        assert!(registry.get("mock").is_some());
        assert!(registry.get("virtfusion").is_none());
        assert_eq!(registry.names(), vec!["mock"]);
    }
}
