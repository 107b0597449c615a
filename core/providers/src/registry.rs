//! Provider registry for dynamic provider resolution.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cloudlink_common::{Error, ProviderId, Result};

use crate::provider::ProviderClient;

/// Factory function type for creating provider clients.
pub type ProviderFactory = Box<dyn Fn(Value) -> Result<Arc<dyn ProviderClient>> + Send + Sync>;

/// Registry for provider client factories.
///
/// Allows dynamic registration and resolution of provider clients
/// by name and configuration.
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a provider factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Provider '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a provider client by name and configuration.
    ///
    /// # Errors
    /// - Provider not found
    /// - Configuration invalid
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn ProviderClient>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Provider '{}' is not registered", name)))?;
        factory(config)
    }

    /// Resolve one client per configured provider.
    pub fn resolve_all(&self, configs: &BTreeMap<String, Value>) -> Result<ProviderClients> {
        let mut clients = ProviderClients::new();
        for (name, config) in configs {
            clients.insert(self.resolve(name, config.clone())?);
        }
        Ok(clients)
    }

    /// Get list of registered provider names.
    pub fn providers(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Check if a provider is registered.
    pub fn has_provider(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolved clients keyed by the provider they serve.
#[derive(Clone, Default)]
pub struct ProviderClients {
    clients: HashMap<ProviderId, Arc<dyn ProviderClient>>,
}

impl ProviderClients {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client under its own provider id, replacing any previous one.
    pub fn insert(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.provider_id().clone(), client);
    }

    /// Client for a provider.
    pub fn get(&self, provider: &ProviderId) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(provider).cloned()
    }

    /// Number of clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Create a registry with default providers.
pub fn create_default_registry() -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    // Scripted provider (for testing)
    registry.register(
        "memory",
        Box::new(|config| {
            let id = config
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("memory");
            Ok(Arc::new(crate::memory::ScriptedProvider::new(ProviderId::new(id)?)))
        }),
    )?;

    // Google Drive
    registry.register(
        "google-drive",
        Box::new(crate::gdrive::create_gdrive_provider),
    )?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ScriptedProvider;

    fn scripted(_: Value) -> Result<Arc<dyn ProviderClient>> {
        Ok(Arc::new(ScriptedProvider::new(ProviderId::new("memory")?)))
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ProviderRegistry::new();
        registry.register("test", Box::new(scripted)).unwrap();

        let provider = registry.resolve("test", Value::Null).unwrap();
        assert_eq!(provider.provider_id().as_str(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ProviderRegistry::new();
        registry.register("test", Box::new(scripted)).unwrap();
        assert!(registry.register("test", Box::new(scripted)).is_err());
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = ProviderRegistry::new();
        assert!(registry.resolve("unknown", Value::Null).is_err());
    }

    #[test]
    fn test_default_registry() {
        let registry = create_default_registry().unwrap();
        assert!(registry.has_provider("memory"));
        assert!(registry.has_provider("google-drive"));
    }

    #[test]
    fn test_resolve_all_keys_by_provider_id() {
        let registry = create_default_registry().unwrap();
        let mut configs = BTreeMap::new();
        configs.insert("memory".to_string(), serde_json::json!({ "id": "scripted" }));

        let clients = registry.resolve_all(&configs).unwrap();
        assert_eq!(clients.len(), 1);
        assert!(clients.get(&ProviderId::new("scripted").unwrap()).is_some());
    }
}
